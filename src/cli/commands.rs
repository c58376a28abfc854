//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DeployBox - declarative build-and-provision engine for application stacks.
#[derive(Parser, Debug)]
#[command(name = "deploybox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "DEPLOYBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the engine configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Plan, build and apply a stack.
    Deploy {
        /// Stack identifier.
        stack: String,
    },

    /// Tear down a stack's infrastructure.
    Destroy {
        /// Stack identifier.
        stack: String,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the merged document for a stack without applying it.
    Render {
        /// Stack identifier.
        stack: String,
    },

    /// Show month-to-date cost per stack.
    Billing {
        /// Resource groups to query; all groups in the subscription if empty.
        resource_groups: Vec<String>,
    },

    /// List known stacks.
    Stacks,

    /// Inspect and repair stored bundles.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show a stack's stored bundle and lease.
    Show {
        /// Stack identifier.
        stack: String,
    },

    /// Remove a stack's lease.
    Unlock {
        /// Stack identifier.
        stack: String,

        /// Remove the lease even if another run holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
