//! CLI argument definitions using clap
//!
//! Commands:
//! - replicore validate-config --config <path>
//! - replicore cluster-for-version --config <path> --version <v>
//! - replicore shard --namespace-id <id> --workflow-id <id> --shard-count <n>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// replicore - durable-execution core operator tool
#[derive(Parser, Debug)]
#[command(name = "replicore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load, validate and print the effective configuration
    ValidateConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./replicore.json")]
        config: PathBuf,
    },

    /// Resolve the cluster that allocated a failover version
    ClusterForVersion {
        /// Path to configuration file
        #[arg(long, default_value = "./replicore.json")]
        config: PathBuf,

        /// Failover version to resolve
        #[arg(long = "version", allow_negative_numbers = true)]
        failover_version: i64,
    },

    /// Compute the history shard owning a workflow
    Shard {
        #[arg(long)]
        namespace_id: String,

        #[arg(long)]
        workflow_id: String,

        #[arg(long)]
        shard_count: i32,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
