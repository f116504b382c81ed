//! Command trait for the shent CLI.
//!
//! Every subcommand implements the same shape so `main` can dispatch them
//! uniformly.

use crate::config::Config;
use crate::error::Result;

/// Standard command trait that all shent commands implement.
///
/// # Type Parameters
/// * `Args` - The arguments type for this command
/// * `Output` - The output type returned by this command
pub trait Command {
    /// The arguments type for this command.
    type Args;

    /// The output type returned by this command.
    type Output;

    /// Create a new command instance with the given arguments.
    fn new(args: Self::Args) -> Self;

    /// Execute the command against the effective configuration.
    fn execute(&self, config: &Config) -> Result<Self::Output>;

    /// Get the command name.
    fn name() -> &'static str;
}

/// Short description of a command for logs and help output.
pub trait CommandDescription {
    /// A brief one-line description.
    fn description() -> &'static str;
}
