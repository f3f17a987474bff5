//! Management command framework.
//!
//! A [`ManagementCommand`] names itself, declares its arguments on a
//! [`clap::Command`] and handles the parsed matches. [`CommandRegistry`]
//! collects commands and dispatches to them.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use fetchplan_cli::command::ManagementCommand;
//! use fetchplan_core::{OptimizerResult, Settings};
//!
//! struct PingCommand;
//!
//! #[async_trait]
//! impl ManagementCommand for PingCommand {
//!     fn name(&self) -> &'static str { "ping" }
//!     fn help(&self) -> &'static str { "Check the tool runs" }
//!
//!     async fn handle(
//!         &self,
//!         _matches: &clap::ArgMatches,
//!         _settings: &Settings,
//!     ) -> OptimizerResult<()> {
//!         println!("pong");
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use fetchplan_core::{OptimizerError, OptimizerResult, Settings};

/// A command that can be registered and invoked through the CLI.
#[async_trait]
pub trait ManagementCommand: Send + Sync {
    /// The subcommand name.
    fn name(&self) -> &'static str;

    /// A one-line description.
    fn help(&self) -> &'static str;

    /// Adds arguments to the subcommand. The default adds none.
    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd
    }

    /// Runs the command.
    async fn handle(&self, matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()>;
}

/// Commands by name.
pub struct CommandRegistry {
    commands: HashMap<String, Box<dyn ManagementCommand>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Registers a command, replacing any with the same name.
    pub fn register(&mut self, command: Box<dyn ManagementCommand>) {
        self.commands.insert(command.name().to_string(), command);
    }

    /// The command registered under `name`.
    pub fn get(&self, name: &str) -> Option<&dyn ManagementCommand> {
        self.commands.get(name).map(AsRef::as_ref)
    }

    /// Registered names, sorted.
    pub fn list_commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The top-level clap command with every registered subcommand and the
    /// global `--settings` option.
    pub fn build_cli(&self) -> clap::Command {
        let mut app = clap::Command::new("fetchplan")
            .about("Inspect and move the fetchplan field registry")
            .subcommand_required(true)
            .arg(
                clap::Arg::new("settings")
                    .long("settings")
                    .global(true)
                    .value_parser(clap::value_parser!(PathBuf))
                    .help("Settings file (.toml or .json); defaults to ./fetchplan.toml if present"),
            );

        let mut entries: Vec<_> = self.commands.values().collect();
        entries.sort_by_key(|cmd| cmd.name());
        for cmd in entries {
            let sub = clap::Command::new(cmd.name()).about(cmd.help());
            app = app.subcommand(cmd.add_arguments(sub));
        }
        app
    }

    /// Dispatches to the subcommand named in `matches`.
    pub async fn execute(&self, matches: &clap::ArgMatches, settings: &Settings) -> OptimizerResult<()> {
        let (name, sub_matches) = matches.subcommand().ok_or_else(|| {
            OptimizerError::ConfigurationError("No subcommand specified".to_string())
        })?;
        let cmd = self
            .get(name)
            .ok_or_else(|| OptimizerError::ConfigurationError(format!("Unknown command: {name}")))?;
        tracing::debug!(command = name, "running management command");
        cmd.handle(sub_matches, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCommand(&'static str);

    #[async_trait]
    impl ManagementCommand for EchoCommand {
        fn name(&self) -> &'static str {
            self.0
        }

        fn help(&self) -> &'static str {
            "A test command"
        }

        fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
            cmd.arg(
                clap::Arg::new("verbose")
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue),
            )
        }

        async fn handle(&self, _matches: &clap::ArgMatches, _settings: &Settings) -> OptimizerResult<()> {
            Ok(())
        }
    }

    struct FailingCommand;

    #[async_trait]
    impl ManagementCommand for FailingCommand {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn help(&self) -> &'static str {
            "Always fails"
        }

        async fn handle(&self, _matches: &clap::ArgMatches, _settings: &Settings) -> OptimizerResult<()> {
            Err(OptimizerError::ConfigurationError("deliberate failure".to_string()))
        }
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = CommandRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(EchoCommand("show")));
        let cmd = registry.get("show").unwrap();
        assert_eq!(cmd.name(), "show");
        assert_eq!(cmd.help(), "A test command");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_list_commands_sorted() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(EchoCommand("show")));
        registry.register(Box::new(EchoCommand("clear")));
        registry.register(Box::new(EchoCommand("export")));
        registry.register(Box::new(EchoCommand("export")));
        assert_eq!(registry.list_commands(), vec!["clear", "export", "show"]);
    }

    #[test]
    fn test_build_cli_parses_global_settings() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(EchoCommand("show")));
        let matches = registry
            .build_cli()
            .try_get_matches_from(["fetchplan", "show", "--verbose", "--settings", "conf.toml"])
            .unwrap();
        assert_eq!(
            matches.get_one::<PathBuf>("settings"),
            Some(&PathBuf::from("conf.toml"))
        );
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "show");
        assert!(sub.get_flag("verbose"));
    }

    #[test]
    fn test_build_cli_requires_subcommand() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(EchoCommand("show")));
        assert!(registry.build_cli().try_get_matches_from(["fetchplan"]).is_err());
    }

    #[tokio::test]
    async fn test_execute_dispatches() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(EchoCommand("show")));
        registry.register(Box::new(FailingCommand));
        let settings = Settings::default();

        let ok = registry
            .build_cli()
            .try_get_matches_from(["fetchplan", "show"])
            .unwrap();
        assert!(registry.execute(&ok, &settings).await.is_ok());

        let fail = registry
            .build_cli()
            .try_get_matches_from(["fetchplan", "fail"])
            .unwrap();
        assert!(registry.execute(&fail, &settings).await.is_err());
    }
}
