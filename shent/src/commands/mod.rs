//! Command modules for the shent CLI.
//!
//! Each subcommand lives in its own file and implements [`traits::Command`].

pub mod common;
pub mod traits;

pub mod config;
pub mod emit;
pub mod init;
pub mod simulate;

pub use config::{run_config, ConfigArgs};
pub use emit::{run_emit, EmitArgs};
pub use init::{run_init, InitArgs};
pub use simulate::{run_simulate, SimulateArgs};
