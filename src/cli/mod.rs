//! CLI module for the DeployBox engine.
//!
//! This module provides the command-line interface for deploying,
//! rendering and tearing down stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
