//! End-to-end runs of the built-in commands against a file-backed registry.

use std::path::Path;

use fetchplan::{CodeSite, FieldCategory, FieldRegistry, FileStore, Location};
use fetchplan_cli::commands::{open_code_registry, open_registry};
use fetchplan_cli::{load_settings, register_builtin_commands, CommandRegistry};
use fetchplan_core::Settings;

fn settings_for(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.field_registry.location = dir.join("registry");
    settings.code_registry.location = dir.join("code");
    settings
}

async fn run(settings: &Settings, args: &[&str]) -> fetchplan_core::OptimizerResult<()> {
    let mut registry = CommandRegistry::new();
    register_builtin_commands(&mut registry);
    let argv: Vec<&str> = std::iter::once("fetchplan").chain(args.iter().copied()).collect();
    let matches = registry.build_cli().try_get_matches_from(argv).unwrap();
    registry.execute(&matches, settings).await
}

// ═════════════════════════════════════════════════════════════════════
// 1. Moving a registry between stores
// ═════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_export_clear_import_restores_entries() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_for(dir.path());
    let registry = open_registry(&settings).unwrap();
    let location = Location::new("shop/views", "list", "order");
    registry
        .add_fields(&location, FieldCategory::Select, ["customer"])
        .await
        .unwrap();
    registry
        .add_fields(&location, FieldCategory::Prefetch, ["lines"])
        .await
        .unwrap();
    let before = registry.entries().await.unwrap();

    let csv = dir.path().join("registry.csv");
    let csv_arg = csv.to_str().unwrap();
    run(&settings, &["export", csv_arg]).await.unwrap();
    run(&settings, &["clear"]).await.unwrap();
    assert!(registry.keys().await.unwrap().is_empty());

    run(&settings, &["import", csv_arg]).await.unwrap();
    assert_eq!(registry.entries().await.unwrap(), before);
}

#[tokio::test]
async fn test_import_into_another_store() {
    let dir = tempfile::tempdir().unwrap();
    let source = settings_for(&dir.path().join("a"));
    let target = settings_for(&dir.path().join("b"));
    open_registry(&source)
        .unwrap()
        .add_fields(&Location::new("blog/feed", "latest", "post"), FieldCategory::Only, ["title"])
        .await
        .unwrap();

    let csv = dir.path().join("moved.csv");
    let csv_arg = csv.to_str().unwrap();
    run(&source, &["export", csv_arg]).await.unwrap();
    run(&target, &["import", "--keep", csv_arg]).await.unwrap();

    let moved = FieldRegistry::new(std::sync::Arc::new(FileStore::new(dir.path().join("b/registry"))));
    assert_eq!(moved.keys().await.unwrap(), vec!["blog/feed/latest/post"]);
}

// ═════════════════════════════════════════════════════════════════════
// 2. Failures
// ═════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_show_unknown_key_fails() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_for(dir.path());
    assert!(run(&settings, &["show", "missing/key/here"]).await.is_err());
    assert!(run(&settings, &["show"]).await.is_ok());
}

#[tokio::test]
async fn test_unknown_backend_fails() {
    let mut settings = Settings::default();
    settings.field_registry.backend = "redis".into();
    assert!(run(&settings, &["clear"]).await.is_err());
}

// ═════════════════════════════════════════════════════════════════════
// 3. Settings files
// ═════════════════════════════════════════════════════════════════════

#[test]
fn test_load_settings_from_toml_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let toml_path = dir.path().join("conf.toml");
    std::fs::write(
        &toml_path,
        "disable_observation = true\n[field_registry]\nbackend = \"memory\"\nlocation = \"unused\"\n",
    )
    .unwrap();
    let settings = load_settings(Some(&toml_path)).unwrap();
    assert!(settings.disable_observation);
    assert_eq!(settings.field_registry.backend, "memory");

    let json_path = dir.path().join("conf.json");
    std::fs::write(&json_path, r#"{"disable_optimization": true}"#).unwrap();
    let settings = load_settings(Some(&json_path)).unwrap();
    assert!(settings.disable_optimization);
}

#[test]
fn test_load_settings_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_settings(Some(&dir.path().join("absent.toml"))).is_err());
}

// ═════════════════════════════════════════════════════════════════════
// 4. Annotating sources
// ═════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_annotate_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_for(dir.path());
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("views.rs"), "let orders = q;
").unwrap();

    let code = open_code_registry(&settings).unwrap();
    let site = CodeSite {
        location: Location::numbered("src/views", "order", 1),
        path: "src/views.rs".to_string(),
    };
    code.record(&site, ".only([\"id\"])").await.unwrap();

    let root = dir.path().to_str().unwrap();
    run(&settings, &["annotate", "--root", root]).await.unwrap();
    code.record(&site, ".only([\"id\", \"total\"])").await.unwrap();
    run(&settings, &["annotate", "--root", root]).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(src.join("views.rs")).unwrap(),
        "let orders = q;  // fetchplan (order): .only([\"id\", \"total\"])\n"
    );
}

#[tokio::test]
async fn test_annotate_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_for(dir.path());
    let site = CodeSite {
        location: Location::numbered("src/gone", "order", 3),
        path: "src/gone.rs".to_string(),
    };
    open_code_registry(&settings)
        .unwrap()
        .record(&site, ".only([\"id\"])")
        .await
        .unwrap();
    let root = dir.path().to_str().unwrap();
    let err = run(&settings, &["annotate", "--root", root]).await.unwrap_err();
    assert!(err.is_storage_error());
}
