//! Error taxonomy. Each variant carries enough context to produce a
//! remediation-hint message; the binary entry point matches on these to
//! pick an exit code, while internal call sites that don't need to
//! distinguish a specific failure class thread a plain `anyhow::Error`.

use thiserror::Error;

use crate::timestamp::ClusterTime;

#[derive(Debug, Error)]
pub enum MongosyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("precondition violation: {0}")]
    Precondition(String),

    #[error("snapshot failed for collection '{collection}': {source}")]
    Snapshot {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("view recreation failed: {0}")]
    View(#[source] anyhow::Error),

    #[error("oplog read failed: {0}")]
    Oplog(#[source] anyhow::Error),

    #[error("write to target failed while applying event with clusterTime {cluster_time:?}: {source}")]
    Write {
        cluster_time: Option<ClusterTime>,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkpoint write failed for database '{database}': {source}")]
    Checkpoint {
        database: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unsupported or destructive change-stream event '{operation_type}' on database '{database}'")]
    UnsupportedEvent {
        database: String,
        operation_type: String,
    },

    #[error("change-stream resume token expired or invalid for database '{database}'; the source's oplog retention window was exceeded during the snapshot")]
    ResumeTokenExpired { database: String },
}

impl MongosyncError {
    /// The process exit code this error should produce.
    pub fn exit_code(&self) -> i32 {
        match self {
            // all fatal classes: non-zero
            MongosyncError::Config(_)
            | MongosyncError::Precondition(_)
            | MongosyncError::Snapshot { .. }
            | MongosyncError::View(_)
            | MongosyncError::Oplog(_)
            | MongosyncError::Write { .. }
            | MongosyncError::Checkpoint { .. }
            | MongosyncError::UnsupportedEvent { .. }
            | MongosyncError::ResumeTokenExpired { .. } => 1,
        }
    }
}
