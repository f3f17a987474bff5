use std::path::PathBuf;
use std::process::ExitCode;

use fetchplan_cli::{load_settings, register_builtin_commands, CommandRegistry};
use fetchplan_core::logging::setup_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let mut registry = CommandRegistry::new();
    register_builtin_commands(&mut registry);
    let matches = registry.build_cli().get_matches();

    let settings = match load_settings(matches.get_one::<PathBuf>("settings").map(PathBuf::as_path)) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&settings);

    match registry.execute(&matches, &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
