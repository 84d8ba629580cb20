//! Thin wrapper over the document-store driver: connections, collection
//! handles, oplog read, change-stream open, index/view introspection, and
//! the mutating operations the applier needs. Exposed as a trait so the
//! snapshot engine and applier can be driven against an in-memory fake in
//! tests — not to support swapping real document-store backends.

mod fake;
mod mongo;

pub use fake::FakeStoreClient;
pub use mongo::MongoStoreClient;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::Stream;
use std::pin::Pin;

use crate::timestamp::ClusterTime;

/// `(keys, name, options)` with `_id_` and the `key`/`ns` fields already
/// stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub keys: Vec<(String, Bson)>,
    pub name: String,
    pub options: Document,
}

/// A source view: `{name, viewOn, pipeline}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDescriptor {
    pub name: String,
    pub view_on: String,
    pub pipeline: Vec<Document>,
}

/// The `operationType` discriminant of a change-stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Rename,
    Drop,
    DropDatabase,
    /// Anything else: a protocol version the applier does not understand.
    Other(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Rename => "rename",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Other(s) => s.as_str(),
        }
    }
}

/// A single change-stream event, reduced to exactly the fields the
/// applier's dispatch table consumes.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub cluster_time: ClusterTime,
    pub collection: String,
    pub document_id: Option<Bson>,
    pub full_document: Option<Document>,
    pub updated_fields: Option<Document>,
    pub removed_fields: Vec<String>,
    pub rename_to_collection: Option<String>,
}

/// One batch of raw-read documents; a stream of these lets the snapshot
/// engine log progress after each batch without materializing the whole
/// collection in memory.
pub type BatchStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<Document>>> + Send>>;

#[async_trait]
pub trait ChangeStreamCursor: Send {
    /// Returns `Ok(None)` only if the underlying stream is exhausted, which
    /// should not normally happen for a tailable change stream; a resume
    /// token failure is surfaced as an `Err`.
    async fn try_next(&mut self) -> anyhow::Result<Option<ChangeEvent>>;
}

pub type ChangeStreamHandle = Box<dyn ChangeStreamCursor>;

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// True if the logical database already exists on the target.
    async fn target_database_exists(&self) -> anyhow::Result<bool>;

    /// Non-system, non-view collections on the source
    /// (`name $nin [system.profile, system.views]`).
    async fn list_source_collections(&self) -> anyhow::Result<Vec<String>>;

    async fn list_source_views(&self) -> anyhow::Result<Vec<ViewDescriptor>>;

    async fn estimated_source_count(&self, collection: &str) -> anyhow::Result<u64>;

    async fn estimated_target_count(&self, collection: &str) -> anyhow::Result<u64>;

    async fn read_source_batches(
        &self,
        collection: &str,
        batch_size: u32,
    ) -> anyhow::Result<BatchStream>;

    /// Insert-then-delete a placeholder document, materializing an empty
    /// target collection ahead of index creation.
    async fn insert_target_placeholder(&self, collection: &str) -> anyhow::Result<()>;

    async fn bulk_insert_target(&self, collection: &str, docs: Vec<Document>) -> anyhow::Result<()>;

    async fn list_source_indexes(&self, collection: &str) -> anyhow::Result<Vec<IndexSpec>>;

    async fn create_target_index(&self, collection: &str, index: &IndexSpec) -> anyhow::Result<()>;

    async fn target_collection_exists(&self, name: &str) -> anyhow::Result<bool>;

    async fn drop_target_collection(&self, name: &str) -> anyhow::Result<()>;

    async fn create_target_view(&self, view: &ViewDescriptor) -> anyhow::Result<()>;

    /// The most recent oplog entry's cluster time, or `None` if the oplog
    /// is empty (fatal, checked by the caller).
    async fn last_oplog_timestamp(&self) -> anyhow::Result<Option<ClusterTime>>;

    async fn open_change_stream(&self, start_at: ClusterTime) -> anyhow::Result<ChangeStreamHandle>;

    async fn replace_target_document(
        &self,
        collection: &str,
        id: &Bson,
        document: Document,
        upsert: bool,
    ) -> anyhow::Result<()>;

    async fn set_target_fields(
        &self,
        collection: &str,
        id: &Bson,
        fields: Document,
    ) -> anyhow::Result<()>;

    async fn unset_target_field(&self, collection: &str, id: &Bson, field: &str) -> anyhow::Result<()>;

    async fn delete_target_document(&self, collection: &str, id: &Bson) -> anyhow::Result<()>;

    async fn rename_target_collection(&self, from: &str, to: &str) -> anyhow::Result<()>;

    async fn close(&self);
}
