//! The `export` command: writes the registry to a CSV file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fetchplan_core::{OptimizerError, OptimizerResult, Settings};

use super::{emit, open_registry};
use crate::command::ManagementCommand;

/// Writes every registry entry to a file.
pub struct ExportCommand;

/// Exports the configured registry to `path`. Returns the number of rows.
pub async fn export_registry(settings: &Settings, path: &Path) -> OptimizerResult<usize> {
    open_registry(settings)?.export_csv(path).await
}

#[async_trait]
impl ManagementCommand for ExportCommand {
    fn name(&self) -> &'static str {
        "export"
    }

    fn help(&self) -> &'static str {
        "Write the field registry to a CSV file"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("path")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Destination file"),
        )
    }

    async fn handle(&self, matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()> {
        let path = matches
            .get_one::<PathBuf>("path")
            .ok_or_else(|| OptimizerError::ConfigurationError("export requires a path".to_string()))?;
        let rows = export_registry(settings, path).await?;
        emit(format!("Exported {rows} entries to {}", path.display())).await
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

    #[tokio::test]
    async fn test_export_writes_one_line_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let settings = file_settings(dir.path());
        let registry = open_registry(&settings).unwrap();
        let location = Location::new("shop/views", "list", "order");
        registry
            .add_fields(&location, FieldCategory::Select, ["customer"])
            .await
            .unwrap();
        registry
            .add_fields(&location.with_name("line"), FieldCategory::Only, ["qty"])
            .await
            .unwrap();

        let out = dir.path().join("out.csv");
        assert_eq!(export_registry(&settings, &out).await.unwrap(), 2);
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("shop/views/list/order"));
    }

    #[tokio::test]
    async fn test_export_of_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        assert_eq!(export_registry(&file_settings(dir.path()), &out).await.unwrap(), 0);
        assert!(std::fs::read_to_string(&out).unwrap().is_empty());
    }

    #[test]
    fn test_path_is_required() {
        let cmd = ExportCommand.add_arguments(clap::Command::new("export"));
        assert!(cmd.try_get_matches_from(["export"]).is_err());
    }
}
