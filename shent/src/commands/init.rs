//! Init command implementation.
//!
//! Writes a `shent.toml` holding the default barrier and simulation
//! settings so they can be edited in place.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::commands::traits::{Command, CommandDescription};
use crate::config::{Config, CONFIG_FILE_NAME};
use crate::error::{Result, ShentError};

/// Arguments for the init command.
#[derive(Debug, Clone, Default)]
pub struct InitArgs {
    /// Directory to write into (default: current directory)
    pub path: Option<PathBuf>,
    /// Overwrite an existing configuration file
    pub force: bool,
}

/// Init command handler.
pub struct InitCommand {
    args: InitArgs,
}

impl InitCommand {
    fn target_dir(&self) -> PathBuf {
        self.args.path.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    fn validate_target(&self, dir: &Path, file: &Path) -> Result<()> {
        if dir.exists() && !dir.is_dir() {
            return Err(ShentError::Validation(format!(
                "Target path is not a directory: {}",
                dir.display()
            )));
        }
        if file.exists() && !self.args.force {
            return Err(ShentError::Validation(format!(
                "{} already exists (use --force to overwrite)",
                file.display()
            )));
        }
        Ok(())
    }
}

impl Command for InitCommand {
    type Args = InitArgs;
    type Output = PathBuf;

    fn new(args: Self::Args) -> Self {
        Self { args }
    }

    /// Writes the defaults, not `config`, so a stale file never leaks
    /// into the new one.
    fn execute(&self, _config: &Config) -> Result<Self::Output> {
        let dir = self.target_dir();
        let file = dir.join(CONFIG_FILE_NAME);
        self.validate_target(&dir, &file)?;

        Config::default().save_to_path(&file)?;
        info!("wrote {}", file.display());
        Ok(file)
    }

    fn name() -> &'static str {
        "init"
    }
}

impl CommandDescription for InitCommand {
    fn description() -> &'static str {
        "Write a default shent.toml"
    }
}

/// Run the init command.
pub fn run_init(args: InitArgs, config: &Config) -> Result<()> {
    let file = InitCommand::new(args).execute(config)?;
    println!("Created {}", file.display());
    Ok(())
}
