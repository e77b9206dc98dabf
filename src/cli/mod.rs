//! CLI module for replicore
//!
//! Operator commands:
//! - validate-config: print the effective configuration
//! - cluster-for-version: resolve the owner of a failover version
//! - shard: map a workflow to its history shard

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{cluster_for_version, run, run_command, shard, validate_config};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::write_response;
