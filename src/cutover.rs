//! Cutover controller: decides between a fresh load and a resume, enforces
//! the preconditions for each, and hands the resume timestamp off to the
//! applier.

use crate::applier::Applier;
use crate::checkpoint::{save_or_fatal, CheckpointStore};
use crate::context::RunContext;
use crate::error::MongosyncError;
use crate::snapshot::{self, FailurePolicy};
use crate::store::StoreClient;

/// Runs the whole program lifecycle: decides fresh-load vs. resume, runs
/// whichever preconditions and setup that implies, then drives the
/// applier. Returns `Ok(())` both for a clean exit and for the fresh-load
/// short-circuit (target already populated); callers distinguish the two
/// only through logging.
pub async fn run(
    ctx: &RunContext,
    checkpoints: &dyn CheckpointStore,
) -> Result<(), MongosyncError> {
    let start_at = if ctx.config.change_stream.resume {
        resume_preconditions(ctx, checkpoints).await?
    } else {
        match fresh_load_preconditions(ctx, checkpoints).await? {
            Some(start_at) => start_at,
            None => return Ok(()),
        }
    };

    let mut applier = Applier::new(ctx, checkpoints);
    applier.run(start_at).await
}

/// `Ok(None)` means the run should short-circuit successfully (target
/// database already exists).
async fn fresh_load_preconditions(
    ctx: &RunContext,
    checkpoints: &dyn CheckpointStore,
) -> Result<Option<crate::timestamp::ClusterTime>, MongosyncError> {
    if ctx
        .store
        .target_database_exists()
        .await
        .map_err(|source| MongosyncError::Precondition(source.to_string()))?
    {
        ctx.logger.log(format!(
            "target database '{}' already exists; nothing to do for a fresh load",
            ctx.database()
        ));
        return Ok(None);
    }

    if checkpoints
        .load(ctx.database())
        .await
        .map_err(|source| MongosyncError::Precondition(source.to_string()))?
        .is_some()
    {
        return Err(MongosyncError::Precondition(format!(
            "a checkpoint already exists for database '{}' but changeStream.resume is false; \
             set changeStream.resume to true to continue the existing replication, or remove \
             the stale checkpoint row to start over",
            ctx.database()
        )));
    }

    snapshot::capture_pre_snapshot_timestamp(ctx).await?;
    snapshot::copy_collections(ctx, FailurePolicy::from_config(ctx.config.initial_load.fail_fast))
        .await?;
    snapshot::create_views(ctx).await?;

    let t0 = ctx.last_timestamp_from_oplog().ok_or_else(|| {
        MongosyncError::Precondition(
            "pre-snapshot timestamp was not captured before checkpoint seeding".to_string(),
        )
    })?;

    save_or_fatal(checkpoints, ctx.database(), t0).await?;
    ctx.set_resume_time_stamp(t0);
    ctx.logger
        .log(format!("seeded checkpoint at clusterTime {}", t0));

    Ok(Some(t0))
}

async fn resume_preconditions(
    ctx: &RunContext,
    checkpoints: &dyn CheckpointStore,
) -> Result<crate::timestamp::ClusterTime, MongosyncError> {
    let ts = checkpoints
        .load(ctx.database())
        .await
        .map_err(|source| MongosyncError::Precondition(source.to_string()))?
        .ok_or_else(|| {
            MongosyncError::Precondition(format!(
                "changeStream.resume is true but no checkpoint exists for database '{}'; \
                 run a fresh load first",
                ctx.database()
            ))
        })?;

    // The persisted checkpoint is the clusterTime of the last-applied
    // event, so the stream must be reopened one ordinal past it or that
    // event would be replayed.
    let start_at = ts.increment();

    ctx.logger.log(format!(
        "resuming from checkpoint at clusterTime {}, opening stream at {}",
        ts, start_at
    ));
    ctx.set_resume_time_stamp(ts);
    Ok(start_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::test_support::FakeCheckpointStore;
    use crate::config::{ChangeStreamConfig, Config, Endpoint, InitialLoadConfig, WriteConcernLevel};
    use crate::logger::Logger;
    use crate::store::FakeStoreClient;
    use crate::timestamp::ClusterTime;
    use std::sync::Arc;

    fn test_config(resume: bool) -> Config {
        Config {
            database: "shop".to_string(),
            source: Endpoint {
                hostname: "src".into(),
                port: 27017,
                username: "u".into(),
                password: "p".into(),
            },
            target: Endpoint {
                hostname: "tgt".into(),
                port: 27017,
                username: "u".into(),
                password: "p".into(),
            },
            initial_load: InitialLoadConfig {
                batch_size: 100,
                max_workers: 2,
                fail_fast: false,
            },
            change_stream: ChangeStreamConfig {
                resume,
                write_concern: WriteConcernLevel::Tag("majority".to_string()),
                checkpoint_batch_size: 500,
                checkpoint_time_interval: 30.0,
            },
        }
    }

    fn test_context(store: Arc<FakeStoreClient>, resume: bool) -> RunContext {
        let dir = std::env::temp_dir().join(format!(
            "mongosyncdb-cutover-test-{}-{}",
            std::process::id(),
            rand_suffix()
        ));
        let logger = Arc::new(Logger::with_log_dir("shop", &dir).unwrap());
        RunContext::new(store, test_config(resume), logger)
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    #[tokio::test]
    async fn fresh_load_short_circuits_when_target_exists() {
        let store = Arc::new(FakeStoreClient::new());
        store.set_target_database_exists(true);
        let ctx = test_context(Arc::clone(&store), false);
        let checkpoints = FakeCheckpointStore::new();

        run(&ctx, &checkpoints).await.unwrap();
        assert_eq!(checkpoints.load("shop").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fresh_load_fails_when_checkpoint_already_exists() {
        let store = Arc::new(FakeStoreClient::new());
        let ctx = test_context(Arc::clone(&store), false);
        let checkpoints = FakeCheckpointStore::new();
        checkpoints.seed("shop", ClusterTime::new(1, 0));

        let err = run(&ctx, &checkpoints).await.unwrap_err();
        assert!(matches!(err, MongosyncError::Precondition(_)));
    }

    #[tokio::test]
    async fn fresh_load_seeds_checkpoint_from_oplog_timestamp() {
        let store = Arc::new(FakeStoreClient::new());
        store.set_oplog_timestamp(ClusterTime::new(777, 1));
        let ctx = test_context(Arc::clone(&store), false);
        let checkpoints = FakeCheckpointStore::new();

        run(&ctx, &checkpoints).await.unwrap();

        assert_eq!(
            checkpoints.load("shop").await.unwrap(),
            Some(ClusterTime::new(777, 1))
        );
    }

    #[tokio::test]
    async fn resume_fails_without_existing_checkpoint() {
        let store = Arc::new(FakeStoreClient::new());
        let ctx = test_context(Arc::clone(&store), true);
        let checkpoints = FakeCheckpointStore::new();

        let err = run(&ctx, &checkpoints).await.unwrap_err();
        assert!(matches!(err, MongosyncError::Precondition(_)));
    }

    #[tokio::test]
    async fn resume_uses_existing_checkpoint() {
        let store = Arc::new(FakeStoreClient::new());
        let ctx = test_context(Arc::clone(&store), true);
        let checkpoints = FakeCheckpointStore::new();
        checkpoints.seed("shop", ClusterTime::new(55, 3));

        run(&ctx, &checkpoints).await.unwrap();
        assert_eq!(ctx.resume_time_stamp(), Some(ClusterTime::new(55, 3)));
    }
}
