//! CLI command implementations
//!
//! Each command computes a JSON value and `run_command` writes it inside the
//! success envelope. Commands never touch execution state.

use std::path::Path;

use serde_json::{json, Value};

use crate::cluster::{workflow_id_to_shard, ClusterMetadata, StaticClusterMetadata};
use crate::config::CoreConfig;
use crate::observability::{Event, Logger};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Parse arguments and run the selected command.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

pub fn run_command(cmd: Command) -> CliResult<()> {
    let data = match cmd {
        Command::ValidateConfig { config } => validate_config(&config)?,
        Command::ClusterForVersion {
            config,
            failover_version,
        } => cluster_for_version(&config, failover_version)?,
        Command::Shard {
            namespace_id,
            workflow_id,
            shard_count,
        } => shard(&namespace_id, &workflow_id, shard_count)?,
    };
    write_response(data)
}

fn load_config(path: &Path) -> CliResult<CoreConfig> {
    let config = CoreConfig::load(path)?;
    Logger::set_min_severity(config.severity()?);
    Logger::info(
        Event::ConfigLoaded,
        &[
            ("path", &path.display().to_string()),
            ("current_cluster", &config.cluster.current_cluster),
        ],
    );
    Ok(config)
}

/// Effective configuration, defaults filled in.
pub fn validate_config(path: &Path) -> CliResult<Value> {
    let config = load_config(path)?;
    Ok(serde_json::to_value(&config)?)
}

pub fn cluster_for_version(path: &Path, failover_version: i64) -> CliResult<Value> {
    let config = load_config(path)?;
    let metadata = StaticClusterMetadata::new(config.cluster);
    let cluster = metadata
        .cluster_name_for_failover_version(failover_version)
        .ok_or_else(|| {
            CliError::not_found(format!(
                "no cluster allocates failover version {}",
                failover_version
            ))
        })?;
    Ok(json!({
        "version": failover_version,
        "cluster": cluster,
    }))
}

pub fn shard(namespace_id: &str, workflow_id: &str, shard_count: i32) -> CliResult<Value> {
    if shard_count <= 0 {
        return Err(CliError::invalid_argument("shard count must be > 0"));
    }
    Ok(json!({
        "namespace_id": namespace_id,
        "workflow_id": workflow_id,
        "shard_id": workflow_id_to_shard(namespace_id, workflow_id, shard_count),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CliErrorCode;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("replicore.json");
        fs::write(&path, body).unwrap();
        path
    }

    const TWO_CLUSTERS: &str = r#"{
        "cluster": {
            "current_cluster": "east",
            "failover_version_increment": 10,
            "clusters": {
                "east": {"initial_failover_version": 1, "shard_count": 4},
                "west": {"initial_failover_version": 2, "shard_count": 4}
            }
        }
    }"#;

    #[test]
    fn test_validate_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{}");
        let value = validate_config(&path).unwrap();
        assert_eq!(value["log_level"], "info");
        assert_eq!(value["cluster"]["current_cluster"], "active");
    }

    #[test]
    fn test_validate_config_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"log_level": "chatty"}"#);
        let err = validate_config(&path).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_missing_config_file() {
        let dir = TempDir::new().unwrap();
        let err = validate_config(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_cluster_for_version() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, TWO_CLUSTERS);
        assert_eq!(cluster_for_version(&path, 22).unwrap()["cluster"], "west");
        assert_eq!(cluster_for_version(&path, 31).unwrap()["cluster"], "east");

        let err = cluster_for_version(&path, 15).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::NotFound);
    }

    #[test]
    fn test_shard_in_range() {
        let value = shard("ns", "wf", 8).unwrap();
        let id = value["shard_id"].as_i64().unwrap();
        assert!((1..=8).contains(&id));
        assert_eq!(value, shard("ns", "wf", 8).unwrap());
    }

    #[test]
    fn test_shard_rejects_zero_count() {
        let err = shard("ns", "wf", 0).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::InvalidArgument);
    }
}
