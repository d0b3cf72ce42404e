//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for a cluster node.

use clap::{Parser, Subcommand};

/// AI4All Cluster - distributed layer-pipelined inference node
///
/// Discovers peers, partitions model layers across them and dispatches
/// inference requests through the resulting pipeline.
#[derive(Parser, Debug)]
#[command(name = "ai4all-cluster")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (discovery, hop server and backend service)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "AI4ALL_CONFIG")]
        config: Option<String>,

        /// Route requests only; do not execute layers locally
        #[arg(long)]
        no_participate: bool,
    },

    /// Show how a model would be partitioned over the configured peers
    Partition {
        /// Path to a model profile (JSON)
        #[arg(short, long)]
        model: String,

        /// Path to configuration file
        #[arg(short, long, env = "AI4ALL_CONFIG")]
        config: Option<String>,

        /// Print the partition as JSON
        #[arg(long)]
        json: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
