//! The `import` command: loads a CSV file written by `export`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fetchplan_core::{OptimizerError, OptimizerResult, Settings};

use super::{emit, open_registry};
use crate::command::ManagementCommand;

/// Loads registry entries from a file.
///
/// The registry is cleared first unless `--keep` is given; kept entries
/// are replaced by imported rows with the same key.
pub struct ImportCommand;

/// Imports `path` into the configured registry. Returns the number of rows.
pub async fn import_registry(settings: &Settings, path: &Path, keep: bool) -> OptimizerResult<usize> {
    open_registry(settings)?.import_csv(path, !keep).await
}

#[async_trait]
impl ManagementCommand for ImportCommand {
    fn name(&self) -> &'static str {
        "import"
    }

    fn help(&self) -> &'static str {
        "Load the field registry from a CSV file"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("path")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("File written by `export`"),
        )
        .arg(
            clap::Arg::new("keep")
                .long("keep")
                .action(clap::ArgAction::SetTrue)
                .help("Keep existing entries instead of clearing the registry first"),
        )
    }

    async fn handle(&self, matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()> {
        let path = matches
            .get_one::<PathBuf>("path")
            .ok_or_else(|| OptimizerError::ConfigurationError("import requires a path".to_string()))?;
        let keep = matches.get_flag("keep");
        let rows = import_registry(settings, path, keep).await?;
        emit(format!("Imported {rows} entries from {}", path.display())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchplan::{FieldCategory, Location};

    fn file_settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.field_registry.location = dir.join("registry");
        settings
    }

    fn write_csv(dir: &Path) -> PathBuf {
        let path = dir.join("in.csv");
        std::fs::write(
            &path,
            "shop/views/list/order,\"[\"\"customer\"\"]\",[],\"[\"\"total\"\"]\"\n",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_import_replaces_registry() {
        let dir = tempfile::tempdir().unwrap();
        let settings = file_settings(dir.path());
        let stale = Location::new("old/views", "index", "page");
        open_registry(&settings)
            .unwrap()
            .add_fields(&stale, FieldCategory::Only, ["title"])
            .await
            .unwrap();

        let rows = import_registry(&settings, &write_csv(dir.path()), false)
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let registry = open_registry(&settings).unwrap();
        assert_eq!(registry.keys().await.unwrap(), vec!["shop/views/list/order"]);
        let sets = registry.get_key("shop/views/list/order").await.unwrap();
        assert!(sets.select.contains("customer"));
        assert!(sets.prefetch.is_empty());
        assert!(sets.only.contains("total"));
    }

    #[tokio::test]
    async fn test_import_keep_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let settings = file_settings(dir.path());
        let other = Location::new("old/views", "index", "page");
        open_registry(&settings)
            .unwrap()
            .add_fields(&other, FieldCategory::Only, ["title"])
            .await
            .unwrap();

        import_registry(&settings, &write_csv(dir.path()), true)
            .await
            .unwrap();
        let keys = open_registry(&settings).unwrap().keys().await.unwrap();
        assert_eq!(keys, vec!["old/views/index/page", "shop/views/list/order"]);
    }

    #[tokio::test]
    async fn test_import_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = import_registry(&file_settings(dir.path()), &dir.path().join("nope.csv"), false).await;
        assert!(matches!(result, Err(OptimizerError::IoError(_))));
    }
}
