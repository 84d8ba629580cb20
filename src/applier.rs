//! Change-stream applier: consumes the tailing change stream sequentially on
//! a single task and replays each event against the target, checkpointing
//! periodically so a crash can resume without re-reading the whole stream
//! from the beginning.
//!
//! Single-threaded by design: events are applied strictly in the order the
//! stream delivers them, so there is no reordering hazard to guard against
//! with locks — unlike the snapshot engine's parallel collection copy
//! (`crate::snapshot`).

use std::time::{Duration, Instant};

use crate::checkpoint::{save_or_fatal, CheckpointStore};
use crate::context::RunContext;
use crate::error::MongosyncError;
use crate::store::{ChangeEvent, OperationType, StoreClient};
use crate::timestamp::ClusterTime;

/// Owns the mutable apply-loop state. Deliberately not process globals: a
/// fresh `Applier` is created per run and dropped when the run ends or is
/// interrupted.
pub struct Applier<'a> {
    ctx: &'a RunContext,
    checkpoints: &'a dyn CheckpointStore,
    apply_count: u64,
    last_checkpoint_wall: Instant,
}

impl<'a> Applier<'a> {
    pub fn new(ctx: &'a RunContext, checkpoints: &'a dyn CheckpointStore) -> Self {
        Applier {
            ctx,
            checkpoints,
            apply_count: 0,
            last_checkpoint_wall: Instant::now(),
        }
    }

    /// Opens the change stream at `start_at` and applies events until the
    /// stream is closed or shutdown is requested externally (the caller
    /// drops the future on a signal; see `crate::shutdown`).
    pub async fn run(&mut self, start_at: ClusterTime) -> Result<(), MongosyncError> {
        self.ctx
            .logger
            .log(format!("starting change stream applier at {}", start_at));

        let mut stream = self
            .ctx
            .store
            .open_change_stream(start_at)
            .await
            .map_err(MongosyncError::Oplog)?;

        loop {
            let event = stream.try_next().await.map_err(|source| {
                if is_resume_token_expired(&source) {
                    MongosyncError::ResumeTokenExpired {
                        database: self.ctx.database().to_string(),
                    }
                } else {
                    MongosyncError::Write {
                        cluster_time: None,
                        source,
                    }
                }
            })?;

            let event = match event {
                Some(event) => event,
                None => break,
            };

            self.apply(&event).await?;
            self.maybe_checkpoint(event.cluster_time).await?;
        }

        Ok(())
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), MongosyncError> {
        let wrap = |source: anyhow::Error| MongosyncError::Write {
            cluster_time: Some(event.cluster_time),
            source,
        };

        match &event.operation_type {
            OperationType::Insert => {
                let id = event
                    .document_id
                    .clone()
                    .ok_or_else(|| wrap(anyhow::anyhow!("insert event missing documentKey._id")))?;
                let document = event
                    .full_document
                    .clone()
                    .ok_or_else(|| wrap(anyhow::anyhow!("insert event missing fullDocument")))?;

                self.ctx
                    .store
                    .replace_target_document(&event.collection, &id, document, true)
                    .await
                    .map_err(wrap)
            }

            OperationType::Replace => {
                let id = event
                    .document_id
                    .clone()
                    .ok_or_else(|| wrap(anyhow::anyhow!("replace event missing documentKey._id")))?;
                let document = event
                    .full_document
                    .clone()
                    .ok_or_else(|| wrap(anyhow::anyhow!("replace event missing fullDocument")))?;

                self.ctx
                    .store
                    .replace_target_document(&event.collection, &id, document, true)
                    .await
                    .map_err(wrap)
            }

            OperationType::Update => {
                let id = event
                    .document_id
                    .clone()
                    .ok_or_else(|| wrap(anyhow::anyhow!("update event missing documentKey._id")))?;

                if let Some(fields) = event.updated_fields.clone() {
                    if !fields.is_empty() {
                        self.ctx
                            .store
                            .set_target_fields(&event.collection, &id, fields)
                            .await
                            .map_err(wrap)?;
                    }
                }

                for field in &event.removed_fields {
                    self.ctx
                        .store
                        .unset_target_field(&event.collection, &id, field)
                        .await
                        .map_err(wrap)?;
                }

                Ok(())
            }

            OperationType::Delete => {
                let id = event
                    .document_id
                    .clone()
                    .ok_or_else(|| wrap(anyhow::anyhow!("delete event missing documentKey._id")))?;

                self.ctx
                    .store
                    .delete_target_document(&event.collection, &id)
                    .await
                    .map_err(wrap)
            }

            OperationType::Rename => {
                let to = event.rename_to_collection.clone().ok_or_else(|| {
                    wrap(anyhow::anyhow!("rename event missing to.coll"))
                })?;

                // If the target already renamed (e.g. a checkpoint landed
                // right after the rename but before this event was marked
                // applied), treat it as already-done instead of failing the
                // whole run.
                let already_renamed = !self
                    .ctx
                    .store
                    .target_collection_exists(&event.collection)
                    .await
                    .map_err(wrap)?
                    && self
                        .ctx
                        .store
                        .target_collection_exists(&to)
                        .await
                        .map_err(wrap)?;

                if already_renamed {
                    self.ctx.logger.log(format!(
                        "rename '{}' -> '{}' already applied, skipping",
                        event.collection, to
                    ));
                    return Ok(());
                }

                self.ctx
                    .store
                    .rename_target_collection(&event.collection, &to)
                    .await
                    .map_err(wrap)
            }

            OperationType::Drop | OperationType::DropDatabase => {
                Err(MongosyncError::UnsupportedEvent {
                    database: self.ctx.database().to_string(),
                    operation_type: event.operation_type.as_str().to_string(),
                })
            }

            OperationType::Other(kind) => Err(MongosyncError::UnsupportedEvent {
                database: self.ctx.database().to_string(),
                operation_type: kind.clone(),
            }),
        }
    }

    async fn maybe_checkpoint(&mut self, ts: ClusterTime) -> Result<(), MongosyncError> {
        self.apply_count += 1;

        let batch_due = self.apply_count >= self.ctx.config.change_stream.checkpoint_batch_size;
        let time_due = self.last_checkpoint_wall.elapsed()
            >= Duration::from_secs_f64(self.ctx.config.change_stream.checkpoint_time_interval);

        if batch_due || time_due {
            save_or_fatal(self.checkpoints, self.ctx.database(), ts).await?;
            self.ctx.set_resume_time_stamp(ts);
            self.ctx
                .logger
                .log(format!("checkpoint saved at clusterTime {}", ts));
            self.apply_count = 0;
            self.last_checkpoint_wall = Instant::now();
        }

        Ok(())
    }
}

fn is_resume_token_expired(err: &anyhow::Error) -> bool {
    err.to_string().contains("resume")
        && (err.to_string().contains("expired") || err.to_string().contains("not found"))
}
