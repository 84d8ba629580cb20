//! An in-memory [`StoreClient`] double for exercising the snapshot engine,
//! cutover controller, and applier without a live document-store deployment.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream;

use crate::timestamp::ClusterTime;

use super::{
    BatchStream, ChangeEvent, ChangeStreamCursor, ChangeStreamHandle, IndexSpec, StoreClient,
    ViewDescriptor,
};

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

/// Thread-safe in-memory stand-in for one logical database pair (source +
/// target), scripted up-front for a test.
#[derive(Default)]
pub struct FakeStoreClient {
    inner: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    target_database_exists: bool,
    source_collections: Vec<String>,
    source_views: Vec<ViewDescriptor>,
    source: std::collections::HashMap<String, Collection>,
    target: std::collections::HashMap<String, Collection>,
    oplog_timestamp: Option<ClusterTime>,
    pending_events: VecDeque<ChangeEvent>,
    closed: bool,
    failing_collections: std::collections::HashSet<String>,
}

impl FakeStoreClient {
    pub fn new() -> Self {
        FakeStoreClient::default()
    }

    pub fn set_target_database_exists(&self, exists: bool) {
        self.inner.lock().unwrap().target_database_exists = exists;
    }

    pub fn set_oplog_timestamp(&self, ts: ClusterTime) {
        self.inner.lock().unwrap().oplog_timestamp = Some(ts);
    }

    pub fn add_source_collection(&self, name: &str, documents: Vec<Document>, indexes: Vec<IndexSpec>) {
        let mut state = self.inner.lock().unwrap();
        state.source_collections.push(name.to_string());
        state.source.insert(
            name.to_string(),
            Collection {
                documents,
                indexes,
            },
        );
    }

    pub fn add_source_view(&self, view: ViewDescriptor) {
        self.inner.lock().unwrap().source_views.push(view);
    }

    /// Marks a collection so its copy worker fails at the first store call
    /// `copy_one_collection` makes, letting tests exercise the snapshot
    /// engine's failure-policy branch without a live deployment.
    pub fn fail_collection(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_collections
            .insert(name.to_string());
    }

    pub fn push_change_event(&self, event: ChangeEvent) {
        self.inner.lock().unwrap().pending_events.push_back(event);
    }

    pub fn target_documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .lock()
            .unwrap()
            .target
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub fn target_indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.inner
            .lock()
            .unwrap()
            .target
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    pub fn target_has_collection(&self, collection: &str) -> bool {
        self.inner.lock().unwrap().target.contains_key(collection)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait]
impl StoreClient for FakeStoreClient {
    async fn target_database_exists(&self) -> anyhow::Result<bool> {
        Ok(self.inner.lock().unwrap().target_database_exists)
    }

    async fn list_source_collections(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().source_collections.clone())
    }

    async fn list_source_views(&self) -> anyhow::Result<Vec<ViewDescriptor>> {
        Ok(self.inner.lock().unwrap().source_views.clone())
    }

    async fn estimated_source_count(&self, collection: &str) -> anyhow::Result<u64> {
        let state = self.inner.lock().unwrap();
        if state.failing_collections.contains(collection) {
            anyhow::bail!("simulated failure reading collection '{}'", collection);
        }
        Ok(state
            .source
            .get(collection)
            .map(|c| c.documents.len() as u64)
            .unwrap_or(0))
    }

    async fn estimated_target_count(&self, collection: &str) -> anyhow::Result<u64> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .target
            .get(collection)
            .map(|c| c.documents.len() as u64)
            .unwrap_or(0))
    }

    async fn read_source_batches(
        &self,
        collection: &str,
        batch_size: u32,
    ) -> anyhow::Result<BatchStream> {
        let documents = {
            let state = self.inner.lock().unwrap();
            state
                .source
                .get(collection)
                .map(|c| c.documents.clone())
                .unwrap_or_default()
        };

        let batches: Vec<anyhow::Result<Vec<Document>>> = documents
            .chunks(batch_size.max(1) as usize)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        Ok(Box::pin(stream::iter(batches)))
    }

    async fn insert_target_placeholder(&self, collection: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .target
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn bulk_insert_target(&self, collection: &str, docs: Vec<Document>) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .target
            .entry(collection.to_string())
            .or_default()
            .documents
            .extend(docs);
        Ok(())
    }

    async fn list_source_indexes(&self, collection: &str) -> anyhow::Result<Vec<IndexSpec>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .source
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_target_index(&self, collection: &str, index: &IndexSpec) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .target
            .entry(collection.to_string())
            .or_default()
            .indexes
            .push(index.clone());
        Ok(())
    }

    async fn target_collection_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.inner.lock().unwrap().target.contains_key(name))
    }

    async fn drop_target_collection(&self, name: &str) -> anyhow::Result<()> {
        self.inner.lock().unwrap().target.remove(name);
        Ok(())
    }

    async fn create_target_view(&self, view: &ViewDescriptor) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .target
            .insert(view.name.clone(), Collection::default());
        Ok(())
    }

    async fn last_oplog_timestamp(&self) -> anyhow::Result<Option<ClusterTime>> {
        Ok(self.inner.lock().unwrap().oplog_timestamp)
    }

    async fn open_change_stream(&self, start_at: ClusterTime) -> anyhow::Result<ChangeStreamHandle> {
        let events: VecDeque<ChangeEvent> = {
            let state = self.inner.lock().unwrap();
            state
                .pending_events
                .iter()
                .filter(|e| e.cluster_time >= start_at)
                .cloned()
                .collect()
        };
        Ok(Box::new(FakeChangeStream { events }))
    }

    async fn replace_target_document(
        &self,
        collection: &str,
        id: &Bson,
        document: Document,
        upsert: bool,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        let coll = state.target.entry(collection.to_string()).or_default();
        if let Some(existing) = coll.documents.iter_mut().find(|d| d.get("_id") == Some(id)) {
            *existing = document;
        } else if upsert {
            coll.documents.push(document);
        }
        Ok(())
    }

    async fn set_target_fields(
        &self,
        collection: &str,
        id: &Bson,
        fields: Document,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(coll) = state.target.get_mut(collection) {
            if let Some(existing) = coll.documents.iter_mut().find(|d| d.get("_id") == Some(id)) {
                for (k, v) in fields {
                    existing.insert(k, v);
                }
            }
        }
        Ok(())
    }

    async fn unset_target_field(&self, collection: &str, id: &Bson, field: &str) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(coll) = state.target.get_mut(collection) {
            if let Some(existing) = coll.documents.iter_mut().find(|d| d.get("_id") == Some(id)) {
                existing.remove(field);
            }
        }
        Ok(())
    }

    async fn delete_target_document(&self, collection: &str, id: &Bson) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(coll) = state.target.get_mut(collection) {
            coll.documents.retain(|d| d.get("_id") != Some(id));
        }
        Ok(())
    }

    async fn rename_target_collection(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if !state.target.contains_key(from) {
            anyhow::bail!("rename failed: source collection '{}' does not exist", from);
        }
        let coll = state.target.remove(from).unwrap();
        state.target.insert(to.to_string(), coll);
        Ok(())
    }

    async fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}

struct FakeChangeStream {
    events: VecDeque<ChangeEvent>,
}

#[async_trait]
impl ChangeStreamCursor for FakeChangeStream {
    async fn try_next(&mut self) -> anyhow::Result<Option<ChangeEvent>> {
        Ok(self.events.pop_front())
    }
}
