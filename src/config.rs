//! Core configuration
//!
//! Loaded once at startup from a JSON file. Every field has a default so a
//! partial file (or `{}`) is a valid configuration; `validate()` rejects
//! combinations the engine cannot run with.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::Severity;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Minimum log severity: trace, info, warn or error
    pub log_level: String,
    pub transaction: TransactionConfig,
    pub task: TaskConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub worker_pool: WorkerPoolConfig,
    pub resend: ResendConfig,
    pub dlq: DlqConfig,
    pub cluster: ClusterConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            transaction: TransactionConfig::default(),
            task: TaskConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            resend: ResendConfig::default(),
            dlq: DlqConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> ConfigResult<Self> {
        let config: CoreConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.severity()?;
        self.transaction.validate()?;
        self.task.validate()?;
        self.circuit_breaker.validate()?;
        self.worker_pool.validate()?;
        self.resend.validate()?;
        self.dlq.validate()?;
        self.cluster.validate()
    }
}

impl CoreConfig {
    pub fn severity(&self) -> ConfigResult<Severity> {
        Severity::parse(&self.log_level)
            .ok_or_else(|| invalid(format!("unknown log level {:?}", self.log_level)))
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

// ---------------------------------------------------------------------------
// transaction
// ---------------------------------------------------------------------------

/// Transaction close behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Track versioned transitions on every Active close
    pub transition_history_enabled: bool,
    /// Tombstones kept per execution before falling back to snapshots
    pub tombstone_count_limit: usize,
    pub checksum: ChecksumConfig,
    /// Executions kept in the cache; idle ones beyond this are dropped
    pub cache_max_entries: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            transition_history_enabled: true,
            tombstone_count_limit: default_tombstone_count_limit(),
            checksum: ChecksumConfig::default(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

fn default_tombstone_count_limit() -> usize {
    16
}

fn default_cache_max_entries() -> usize {
    4096
}

impl TransactionConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.tombstone_count_limit == 0 {
            return Err(invalid("transaction.tombstone_count_limit must be > 0"));
        }
        if self.cache_max_entries == 0 {
            return Err(invalid("transaction.cache_max_entries must be > 0"));
        }
        self.checksum.validate()
    }
}

/// Probabilistic checksum generation and verification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    /// Percentage (0-100) of closes that compute a checksum
    pub generate_probability: u32,
    /// Percentage (0-100) of loads that verify the stored checksum
    pub verify_probability: u32,
    /// State last written before this instant has its checksum invalidated
    /// instead of failing verification
    pub invalidate_before: Option<DateTime<Utc>>,
}

impl ChecksumConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.generate_probability > 100 || self.verify_probability > 100 {
            return Err(invalid("checksum probabilities must be within 0-100"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// task
// ---------------------------------------------------------------------------

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicyConfig {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    /// Fraction of the interval randomized away (0.0-1.0)
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicyConfig {
    fn default() -> Self {
        Self::new(1_000, 1.1, 180_000)
    }
}

impl BackoffPolicyConfig {
    pub fn new(initial_interval_ms: u64, backoff_coefficient: f64, maximum_interval_ms: u64) -> Self {
        Self {
            initial_interval_ms,
            backoff_coefficient,
            maximum_interval_ms,
            jitter_fraction: 0.2,
        }
    }

    fn validate(&self, name: &str) -> ConfigResult<()> {
        if self.initial_interval_ms == 0 {
            return Err(invalid(format!("{}.initial_interval_ms must be > 0", name)));
        }
        if self.backoff_coefficient < 1.0 {
            return Err(invalid(format!("{}.backoff_coefficient must be >= 1.0", name)));
        }
        if self.maximum_interval_ms < self.initial_interval_ms {
            return Err(invalid(format!(
                "{}.maximum_interval_ms must be >= initial_interval_ms",
                name
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(invalid(format!("{}.jitter_fraction must be within 0-1", name)));
        }
        Ok(())
    }
}

/// Retry and dead-letter behavior of task executables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub resubmit_max_attempts: u32,
    pub resource_exhausted_resubmit_max_attempts: u32,
    pub max_unexpected_error_attempts: u32,
    /// Attempts after which unexpected errors log at error severity
    pub critical_log_attempts: u32,
    pub dlq_enabled: bool,
    /// Treat internal errors as terminal
    pub dlq_internal_errors: bool,
    /// Error messages matching any of these go straight to the DLQ
    pub dlq_error_patterns: Vec<String>,
    pub reschedule_policy: BackoffPolicyConfig,
    pub task_not_ready_policy: BackoffPolicyConfig,
    pub dependency_not_completed_policy: BackoffPolicyConfig,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            resubmit_max_attempts: 10,
            resource_exhausted_resubmit_max_attempts: 1,
            max_unexpected_error_attempts: 70,
            critical_log_attempts: 30,
            dlq_enabled: true,
            dlq_internal_errors: false,
            dlq_error_patterns: Vec::new(),
            reschedule_policy: BackoffPolicyConfig::new(1_000, 1.1, 180_000),
            task_not_ready_policy: BackoffPolicyConfig::new(3_000, 1.5, 180_000),
            dependency_not_completed_policy: BackoffPolicyConfig::new(10_000, 1.5, 600_000),
        }
    }
}

impl TaskConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_unexpected_error_attempts == 0 {
            return Err(invalid("task.max_unexpected_error_attempts must be > 0"));
        }
        for pattern in &self.dlq_error_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| invalid(format!("task.dlq_error_patterns: {}", e)))?;
        }
        self.reschedule_policy.validate("task.reschedule_policy")?;
        self.task_not_ready_policy.validate("task.task_not_ready_policy")?;
        self.dependency_not_completed_policy
            .validate("task.dependency_not_completed_policy")
    }
}

// ---------------------------------------------------------------------------
// circuit breaker / worker pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive destination failures that open the circuit
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    /// Trial requests admitted while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 10_000,
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 || self.half_open_max_requests == 0 {
            return Err(invalid(
                "circuit_breaker thresholds must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 1024,
        }
    }
}

impl WorkerPoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.worker_count == 0 || self.queue_capacity == 0 {
            return Err(invalid("worker_pool sizes must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// replication recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResendConfig {
    /// Events requested per raw-history page
    pub page_size: usize,
    /// Batches accumulated before a forced flush
    pub max_event_batch_count: usize,
    pub fetch_timeout_ms: u64,
    pub apply_timeout_ms: u64,
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_event_batch_count: 10,
            fetch_timeout_ms: 30_000,
            apply_timeout_ms: 30_000,
        }
    }
}

impl ResendConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.page_size == 0 || self.max_event_batch_count == 0 {
            return Err(invalid("resend.page_size and max_event_batch_count must be > 0"));
        }
        if self.fetch_timeout_ms == 0 || self.apply_timeout_ms == 0 {
            return Err(invalid("resend timeouts must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub merge_timeout_ms: u64,
    pub default_page_size: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            merge_timeout_ms: 20_000,
            default_page_size: 100,
        }
    }
}

impl DlqConfig {
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.merge_timeout_ms == 0 || self.default_page_size == 0 {
            return Err(invalid("dlq settings must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInfoConfig {
    pub initial_failover_version: i64,
    pub shard_count: i32,
    pub enabled: bool,
}

impl Default for ClusterInfoConfig {
    fn default() -> Self {
        Self {
            initial_failover_version: 1,
            shard_count: 4,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub current_cluster: String,
    pub failover_version_increment: i64,
    pub clusters: BTreeMap<String, ClusterInfoConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert("active".to_string(), ClusterInfoConfig::default());
        Self {
            current_cluster: "active".to_string(),
            failover_version_increment: 10,
            clusters,
        }
    }
}

impl ClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.failover_version_increment <= 0 {
            return Err(invalid("cluster.failover_version_increment must be > 0"));
        }
        if !self.clusters.contains_key(&self.current_cluster) {
            return Err(invalid(format!(
                "cluster.current_cluster '{}' is not in cluster.clusters",
                self.current_cluster
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for (name, info) in &self.clusters {
            if info.shard_count <= 0 {
                return Err(invalid(format!("cluster '{}' shard_count must be > 0", name)));
            }
            if info.initial_failover_version < 0
                || info.initial_failover_version >= self.failover_version_increment
            {
                return Err(invalid(format!(
                    "cluster '{}' initial_failover_version must be within [0, increment)",
                    name
                )));
            }
            if !seen.insert(info.initial_failover_version) {
                return Err(invalid(format!(
                    "cluster '{}' reuses initial_failover_version {}",
                    name, info.initial_failover_version
                )));
            }
        }
        Ok(())
    }
}
