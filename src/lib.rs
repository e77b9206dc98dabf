//! replicore - durable-execution core
//!
//! Versioned execution state with transactional close, a retrying task
//! engine with a dead-letter queue, and cross-cluster replication recovery
//! (history resend and DLQ merge).

pub mod cli;
pub mod cluster;
pub mod config;
pub mod namespace;
pub mod observability;
pub mod replication;
pub mod state;
pub mod tasks;
pub mod versioning;
