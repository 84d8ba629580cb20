//! The run context: an explicit, shared record passed by reference into
//! every component instead of a process-wide global bag.

use std::sync::Arc;
use std::sync::Mutex;

use crate::config::Config;
use crate::logger::Logger;
use crate::store::StoreClient;
use crate::timestamp::ClusterTime;

/// Carries the store client, configuration, and the two timestamps the
/// snapshot/cutover/applier phases hand off to each other.
///
/// `last_timestamp_from_oplog` is written once, by the snapshot engine.
/// `resume_time_stamp` is written only by the applier — the single `Mutex`
/// here exists purely so the field can be read back by callers after the
/// applier updates it; it is not a concurrency primitive guarding
/// concurrent writers, since the applier is single-threaded.
pub struct RunContext {
    pub store: Arc<dyn StoreClient>,
    pub config: Config,
    pub logger: Arc<Logger>,
    last_timestamp_from_oplog: Mutex<Option<ClusterTime>>,
    resume_time_stamp: Mutex<Option<ClusterTime>>,
}

impl RunContext {
    pub fn new(store: Arc<dyn StoreClient>, config: Config, logger: Arc<Logger>) -> Self {
        RunContext {
            store,
            config,
            logger,
            last_timestamp_from_oplog: Mutex::new(None),
            resume_time_stamp: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn set_last_timestamp_from_oplog(&self, ts: ClusterTime) {
        *self.last_timestamp_from_oplog.lock().unwrap() = Some(ts);
    }

    pub fn last_timestamp_from_oplog(&self) -> Option<ClusterTime> {
        *self.last_timestamp_from_oplog.lock().unwrap()
    }

    pub fn set_resume_time_stamp(&self, ts: ClusterTime) {
        *self.resume_time_stamp.lock().unwrap() = Some(ts);
    }

    pub fn resume_time_stamp(&self) -> Option<ClusterTime> {
        *self.resume_time_stamp.lock().unwrap()
    }

    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
