//! Config command implementation.
//!
//! Prints the effective configuration: file settings with the `SHEN_*`
//! environment overrides applied.

use crate::commands::common::OutputFormat;
use crate::commands::traits::{Command, CommandDescription};
use crate::config::Config;
use crate::error::Result;

/// Arguments for the config command.
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub format: OutputFormat,
}

/// Config command handler.
pub struct ConfigCommand {
    args: ConfigArgs,
}

impl Command for ConfigCommand {
    type Args = ConfigArgs;
    type Output = String;

    fn new(args: Self::Args) -> Self {
        Self { args }
    }

    fn execute(&self, config: &Config) -> Result<Self::Output> {
        match self.args.format {
            OutputFormat::Text => config.to_toml(),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(config)?),
        }
    }

    fn name() -> &'static str {
        "config"
    }
}

impl CommandDescription for ConfigCommand {
    fn description() -> &'static str {
        "Print the effective configuration"
    }
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config: &Config) -> Result<()> {
    let output = ConfigCommand::new(args).execute(config)?;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
}
