//! Checkpoint store: persists and retrieves `(database, parameter) ->
//! timestamp` rows in the target's fixed `mongosyncdb.checkpoints` metadata
//! collection. Only the `resumeTimestamp` parameter is used by the core.

use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::options::{Acknowledgment, UpdateOptions, WriteConcern};
use mongodb::Client;

use crate::error::MongosyncError;
use crate::timestamp::ClusterTime;

const METADATA_DATABASE: &str = "mongosyncdb";
const CHECKPOINTS_COLLECTION: &str = "checkpoints";
const RESUME_TIMESTAMP_PARAMETER: &str = "resumeTimestamp";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the `resumeTimestamp` row for `database`, or `None` if absent.
    async fn load(&self, database: &str) -> anyhow::Result<Option<ClusterTime>>;

    /// Upserts the row. Any failure here is fatal: the applier cannot
    /// proceed without durable checkpoints, so the caller is expected to
    /// wrap this in `MongosyncError::Checkpoint`.
    async fn save(&self, database: &str, ts: ClusterTime) -> anyhow::Result<()>;
}

pub struct MongoCheckpointStore {
    checkpoints: mongodb::Collection<Document>,
    write_concern: WriteConcern,
}

impl MongoCheckpointStore {
    pub fn new(target_client: &Client, write_concern: WriteConcern) -> Self {
        let checkpoints = target_client
            .database(METADATA_DATABASE)
            .collection::<Document>(CHECKPOINTS_COLLECTION);

        MongoCheckpointStore {
            checkpoints,
            write_concern,
        }
    }

    pub fn with_default_write_concern(target_client: &Client) -> Self {
        Self::new(
            target_client,
            WriteConcern::builder().w(Acknowledgment::Majority).build(),
        )
    }
}

#[async_trait]
impl CheckpointStore for MongoCheckpointStore {
    async fn load(&self, database: &str) -> anyhow::Result<Option<ClusterTime>> {
        let filter = doc! {
            "database": database,
            "parameter": RESUME_TIMESTAMP_PARAMETER,
        };

        let found = self.checkpoints.find_one(filter, None).await?;
        Ok(found
            .and_then(|doc| doc.get_timestamp("ts").ok())
            .map(ClusterTime::from))
    }

    async fn save(&self, database: &str, ts: ClusterTime) -> anyhow::Result<()> {
        let filter = doc! {
            "database": database,
            "parameter": RESUME_TIMESTAMP_PARAMETER,
        };
        let update = doc! { "$set": { "ts": bson::Timestamp::from(ts) } };
        let options = UpdateOptions::builder()
            .upsert(true)
            .write_concern(self.write_concern.clone())
            .build();

        self.checkpoints.update_one(filter, update, options).await?;
        Ok(())
    }
}

/// Wraps any [`CheckpointStore`] failure as the fatal
/// [`MongosyncError::Checkpoint`] variant.
pub async fn save_or_fatal(
    store: &dyn CheckpointStore,
    database: &str,
    ts: ClusterTime,
) -> Result<(), MongosyncError> {
    store
        .save(database, ts)
        .await
        .map_err(|source| MongosyncError::Checkpoint {
            database: database.to_string(),
            source,
        })
}

/// An in-memory [`CheckpointStore`], kept unconditionally compiled (not
/// gated behind `cfg(test)`) so integration tests and other crates can
/// exercise the cutover controller and applier without a real metadata
/// collection, matching how `crate::store::FakeStoreClient` is exposed.
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCheckpointStore {
        rows: Mutex<HashMap<String, ClusterTime>>,
        pub fail_next_save: std::sync::atomic::AtomicBool,
    }

    impl FakeCheckpointStore {
        pub fn new() -> Self {
            FakeCheckpointStore::default()
        }

        pub fn seed(&self, database: &str, ts: ClusterTime) {
            self.rows.lock().unwrap().insert(database.to_string(), ts);
        }
    }

    #[async_trait]
    impl CheckpointStore for FakeCheckpointStore {
        async fn load(&self, database: &str) -> anyhow::Result<Option<ClusterTime>> {
            Ok(self.rows.lock().unwrap().get(database).copied())
        }

        async fn save(&self, database: &str, ts: ClusterTime) -> anyhow::Result<()> {
            use std::sync::atomic::Ordering;
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                anyhow::bail!("simulated checkpoint write failure");
            }
            self.rows.lock().unwrap().insert(database.to_string(), ts);
            Ok(())
        }
    }
}
