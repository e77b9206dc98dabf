//! Cross-cluster replication recovery
//!
//! Inbound replication tasks are applied to local state by the replica
//! executor. Gaps in local history are filled by resending the missing
//! range from the source cluster, and tasks that can never apply end up
//! in the DLQ, where operators read, purge or merge them.

mod clients;
mod dlq;
mod dlq_handler;
mod errors;
mod executor;
mod fetcher;
mod resender;
mod task;

pub use clients::{
    AdminClient, DataBlob, EncodingType, InMemoryAdminClient, RawHistoryRequest,
    RawHistoryResponse, RemoteClientProvider, ReplicationMessages, ReplicationMessagesRequest,
    StaticClientProvider,
};
pub use dlq::{DlqPage, DlqQueueKey, DlqStore, InMemoryDlqStore};
pub use dlq_handler::{DlqMessages, ReplicationDlqHandler};
pub use errors::{EventRange, ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use executor::{
    ReplicaApplier, ReplicationExecutorAdapter, ReplicationExecutorProvider,
    ReplicationTaskExecutor, StateExecutorProvider, StateReplicationExecutor, StoreDlqWriter,
};
pub use fetcher::ReplicationTaskFetcher;
pub use resender::{EventsApplier, HistoryResender, ResendStats};
pub use task::{
    RecordDetails, ReplicationTask, ReplicationTaskInfo, ReplicationTaskKind,
    ReplicationTaskRecord, StateSync,
};
