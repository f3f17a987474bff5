//! The `annotate` command: writes recorded plans into the source as
//! comments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fetchplan_core::{OptimizerResult, Settings};

use super::{emit, open_code_registry};
use crate::command::ManagementCommand;

/// Appends each recorded plan to the source line of its query.
pub struct AnnotateCommand;

/// Applies the configured code registry to the sources under `root`.
/// Returns the number of annotated lines.
pub async fn annotate_sources(settings: &Settings, root: &Path) -> OptimizerResult<usize> {
    open_code_registry(settings)?.apply_to_code(root).await
}

/// The directory recorded paths are relative to: `project_root` when set,
/// else the working directory.
fn default_root(settings: &Settings) -> PathBuf {
    if settings.project_root.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(&settings.project_root)
    }
}

#[async_trait]
impl ManagementCommand for AnnotateCommand {
    fn name(&self) -> &'static str {
        "annotate"
    }

    fn help(&self) -> &'static str {
        "Write recorded query plans into the source as comments"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("root")
                .long("root")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Directory recorded paths are relative to; defaults to the project root"),
        )
    }

    async fn handle(&self, matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()> {
        let root = matches
            .get_one::<PathBuf>("root")
            .cloned()
            .unwrap_or_else(|| default_root(settings));
        let lines = annotate_sources(settings, &root).await?;
        emit(format!("Annotated {lines} lines under {}", root.display())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchplan::{CodeSite, Location};

    fn file_settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.code_registry.location = dir.join("code");
        settings
    }

    #[tokio::test]
    async fn test_annotate_writes_recorded_plans() {
        let dir = tempfile::tempdir().unwrap();
        let settings = file_settings(dir.path());
        std::fs::create_dir_all(dir.path().join("shop")).unwrap();
        std::fs::write(dir.path().join("shop/views.rs"), "fn a() {}\nfn b() {}\n").unwrap();

        let site = CodeSite {
            location: Location::numbered("shop/views", "order", 2),
            path: "shop/views.rs".to_string(),
        };
        open_code_registry(&settings)
            .unwrap()
            .record(&site, ".select_related([\"customer\"])")
            .await
            .unwrap();

        assert_eq!(annotate_sources(&settings, dir.path()).await.unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("shop/views.rs")).unwrap(),
            "fn a() {}\nfn b() {}  // fetchplan (order): .select_related([\"customer\"])\n"
        );
    }

    #[tokio::test]
    async fn test_annotate_with_nothing_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let settings = file_settings(dir.path());
        assert_eq!(annotate_sources(&settings, dir.path()).await.unwrap(), 0);
    }

    #[test]
    fn test_default_root() {
        assert_eq!(default_root(&Settings::default()), PathBuf::from("."));
        let settings = Settings {
            project_root: "/srv/app".into(),
            ..Settings::default()
        };
        assert_eq!(default_root(&settings), PathBuf::from("/srv/app"));
    }
}
