//! blemesh CLI library
//!
//! Command parsing, configuration loading and the command handlers that
//! drive a [`blemesh_central::CentralManager`] from the terminal.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::CentralApp;
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
