//! The `clear` command.

use async_trait::async_trait;
use fetchplan_core::{OptimizerResult, Settings};

use super::{emit, open_registry};
use crate::command::ManagementCommand;

/// Removes every registry entry.
pub struct ClearCommand;

#[async_trait]
impl ManagementCommand for ClearCommand {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn help(&self) -> &'static str {
        "Forget every learned field set"
    }

    async fn handle(&self, _matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()> {
        let registry = open_registry(settings)?;
        let removed = registry.keys().await?.len();
        registry.clear().await?;
        tracing::info!(removed, "cleared field registry");
        emit(format!("Removed {removed} entries")).await
    }
}
