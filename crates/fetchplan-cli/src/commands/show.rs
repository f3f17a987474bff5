//! The `show` command: prints registry entries.

use async_trait::async_trait;
use fetchplan::{FieldRegistry, FieldSets};
use fetchplan_core::{OptimizerError, OptimizerResult, Settings};

use super::{emit, open_registry};
use crate::command::ManagementCommand;

/// Prints one entry as JSON, or a summary line per key.
pub struct ShowCommand;

/// One summary line: the key and the size of each set.
fn summary_line(key: &str, sets: &FieldSets) -> String {
    format!(
        "{key}  select={} prefetch={} only={}",
        sets.select.len(),
        sets.prefetch.len(),
        sets.only.len()
    )
}

/// Renders `key` as pretty JSON, or every key as a summary when `key` is
/// `None`. Never creates entries.
pub async fn render(registry: &FieldRegistry, key: Option<&str>) -> OptimizerResult<String> {
    match key {
        Some(key) => {
            if !registry.has_key(key).await? {
                return Err(OptimizerError::DoesNotExist(format!(
                    "No registry entry for '{key}'"
                )));
            }
            let sets = registry.get_key(key).await?;
            Ok(serde_json::to_string_pretty(&sets)?)
        }
        None => {
            let entries = registry.entries().await?;
            if entries.is_empty() {
                return Ok("The field registry is empty.".to_string());
            }
            Ok(entries
                .iter()
                .map(|(key, sets)| summary_line(key, sets))
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }
}

#[async_trait]
impl ManagementCommand for ShowCommand {
    fn name(&self) -> &'static str {
        "show"
    }

    fn help(&self) -> &'static str {
        "Print the learned field sets"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(clap::Arg::new("key").help("Print only this location key"))
    }

    async fn handle(&self, matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()> {
        let registry = open_registry(settings)?;
        let key = matches.get_one::<String>("key").map(String::as_str);
        emit(render(&registry, key).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchplan::{FieldCategory, Location};

    async fn seeded() -> FieldRegistry {
        let registry = FieldRegistry::in_memory();
        let location = Location::new("shop/views", "list", "order");
        registry
            .add_fields(&location, FieldCategory::Select, ["customer"])
            .await
            .unwrap();
        registry
            .add_fields(&location, FieldCategory::Only, ["total", "placed"])
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_render_summary() {
        let registry = seeded().await;
        assert_eq!(
            render(&registry, None).await.unwrap(),
            "shop/views/list/order  select=1 prefetch=0 only=2"
        );
    }

    #[tokio::test]
    async fn test_render_single_key_as_json() {
        let registry = seeded().await;
        let text = render(&registry, Some("shop/views/list/order")).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["select"], serde_json::json!(["customer"]));
        assert_eq!(value["only"], serde_json::json!(["placed", "total"]));
    }

    #[tokio::test]
    async fn test_render_unknown_key_does_not_create_it() {
        let registry = seeded().await;
        let result = render(&registry, Some("nowhere/x/y")).await;
        assert!(matches!(result, Err(OptimizerError::DoesNotExist(_))));
        assert_eq!(registry.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_render_empty_registry() {
        let registry = FieldRegistry::in_memory();
        assert_eq!(
            render(&registry, None).await.unwrap(),
            "The field registry is empty."
        );
    }
}
