//! Snapshot engine: captures the pre-snapshot oplog timestamp, copies every
//! non-system collection in parallel, recreates indexes, then recreates
//! views.
//!
//! The bounded-parallel copy loop uses a `futures::stream::buffer_unordered`
//! over a fixed worker count rather than a manual thread pool.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::context::RunContext;
use crate::error::MongosyncError;
use crate::store::StoreClient;

/// Per-collection snapshot error policy: whether a failed collection worker
/// aborts the whole run or is logged and skipped while siblings continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailFast,
    ContinueOnError,
}

impl FailurePolicy {
    pub fn from_config(fail_fast: bool) -> Self {
        if fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::ContinueOnError
        }
    }
}

/// Reads the newest oplog entry's cluster time and stores it on the run
/// context. Fatal if the oplog is empty — the change stream would have no
/// anchor to resume from.
pub async fn capture_pre_snapshot_timestamp(ctx: &RunContext) -> Result<(), MongosyncError> {
    let ts = ctx
        .store
        .last_oplog_timestamp()
        .await
        .map_err(MongosyncError::Oplog)?;

    match ts {
        Some(ts) => {
            ctx.logger.log(format!("oplog timestamp collected: {}", ts));
            ctx.set_last_timestamp_from_oplog(ts);
            Ok(())
        }
        None => Err(MongosyncError::Oplog(anyhow::anyhow!(
            "no oplog entries found; change stream may not start correctly"
        ))),
    }
}

/// Copies every non-system, non-view source collection in parallel, up to
/// `min(collection_count, maxWorkers)` concurrent workers.
pub async fn copy_collections(
    ctx: &RunContext,
    policy: FailurePolicy,
) -> Result<(), MongosyncError> {
    ctx.logger.log("starting parallel collection import");

    let collections = ctx
        .store
        .list_source_collections()
        .await
        .map_err(MongosyncError::Oplog)?;

    let max_workers = ctx.config.initial_load.max_workers.max(1);
    let concurrency = max_workers.min(collections.len().max(1));
    ctx.logger.log(format!(
        "using {} parallel workers for collection import",
        concurrency
    ));

    let logger = Arc::clone(&ctx.logger);
    let store = Arc::clone(&ctx.store);
    let batch_size = ctx.config.initial_load.batch_size;

    let results = stream::iter(collections.into_iter())
        .map(|collection| {
            let store = Arc::clone(&store);
            let logger = Arc::clone(&logger);
            async move {
                let result = copy_one_collection(&*store, &*logger, &collection, batch_size).await;
                (collection, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut failures = Vec::new();
    for (collection, result) in results {
        match result {
            Ok(()) => {
                ctx.logger.log(format!("finished loading collection: {}", collection));
            }
            Err(err) => {
                ctx.logger
                    .log(format!("collection '{}' failed: {}", collection, err));
                failures.push((collection, err));
            }
        }
    }

    if !failures.is_empty() {
        if policy == FailurePolicy::FailFast {
            let (collection, source) = failures.into_iter().next().unwrap();
            return Err(MongosyncError::Snapshot { collection, source });
        }
        // ContinueOnError: sibling collections already ran to completion;
        // overall status still reports success.
    }

    ctx.logger.log("all collections loaded successfully!");
    Ok(())
}

async fn copy_one_collection(
    store: &dyn crate::store::StoreClient,
    logger: &crate::logger::Logger,
    collection: &str,
    batch_size: u32,
) -> anyhow::Result<()> {
    logger.log(format!("fetching data from collection '{}'", collection));

    let count_source = store.estimated_source_count(collection).await?;

    if count_source == 0 {
        logger.log(format!("collection '{}' is empty", collection));
        store.insert_target_placeholder(collection).await?;
    } else {
        logger.log(format!(
            "collection '{}' has {} documents",
            collection, count_source
        ));

        let mut batches = store.read_source_batches(collection, batch_size).await?;
        while let Some(batch) = batches.try_next().await? {
            store.bulk_insert_target(collection, batch).await?;

            let count_target = store.estimated_target_count(collection).await?;
            if count_target <= count_source {
                let percent = ceil_percentage(count_target, count_source);
                logger.log(format!(
                    "loading collection '{}' - {}% completed",
                    collection, percent
                ));
            }
        }

        logger.log(format!("collection '{}' imported successfully", collection));
    }

    create_indexes(store, logger, collection).await;

    Ok(())
}

fn ceil_percentage(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        (done * 100 + total - 1) / total
    }
}

/// Per-index failures are logged and skipped; they never abort the
/// collection or the run.
async fn create_indexes(store: &dyn crate::store::StoreClient, logger: &crate::logger::Logger, collection: &str) {
    let indexes = match store.list_source_indexes(collection).await {
        Ok(indexes) => indexes,
        Err(err) => {
            logger.log(format!(
                "failed to read indexes for collection '{}': {}",
                collection, err
            ));
            return;
        }
    };

    for index in indexes {
        match store.create_target_index(collection, &index).await {
            Ok(()) => logger.log(format!(
                "index '{}' created in collection '{}'",
                index.name, collection
            )),
            Err(err) => logger.log(format!(
                "failed to create index '{}' in collection '{}': {}",
                index.name, collection, err
            )),
        }
    }
}

/// Recreates views on the target. View failures are fatal.
pub async fn create_views(ctx: &RunContext) -> Result<(), MongosyncError> {
    ctx.logger.log("creating database views");

    let views = ctx
        .store
        .list_source_views()
        .await
        .map_err(MongosyncError::View)?;

    for view in views {
        ctx.logger.log(format!(
            "creating view '{}' on source '{}' with pipeline: {:?}",
            view.name, view.view_on, view.pipeline
        ));

        ctx.store
            .create_target_view(&view)
            .await
            .map_err(MongosyncError::View)?;

        ctx.logger
            .log(format!("view '{}' created successfully", view.name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChangeStreamConfig, Config, Endpoint, InitialLoadConfig, WriteConcernLevel};
    use crate::logger::Logger;
    use crate::store::{FakeStoreClient, IndexSpec, ViewDescriptor};
    use crate::timestamp::ClusterTime;
    use bson::{doc, Bson};

    fn test_config(max_workers: usize, fail_fast: bool) -> Config {
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
                batch_size: 2,
                max_workers,
                fail_fast,
            },
            change_stream: ChangeStreamConfig {
                resume: false,
                write_concern: WriteConcernLevel::Tag("majority".to_string()),
                checkpoint_batch_size: 500,
                checkpoint_time_interval: 30.0,
            },
        }
    }

    fn test_context(store: Arc<FakeStoreClient>, max_workers: usize, fail_fast: bool) -> RunContext {
        let dir = std::env::temp_dir().join(format!(
            "mongosyncdb-snapshot-test-{}-{}",
            std::process::id(),
            rand_suffix()
        ));
        let logger = Arc::new(Logger::with_log_dir("shop", &dir).unwrap());
        RunContext::new(store, test_config(max_workers, fail_fast), logger)
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }

    #[tokio::test]
    async fn empty_collection_gets_placeholder_and_indexes() {
        let store = Arc::new(FakeStoreClient::new());
        store.add_source_collection(
            "c",
            vec![],
            vec![IndexSpec {
                keys: vec![("a".to_string(), Bson::Int32(1))],
                name: "a_1".to_string(),
                options: doc! {},
            }],
        );
        let ctx = test_context(Arc::clone(&store), 4, false);

        copy_collections(&ctx, FailurePolicy::ContinueOnError)
            .await
            .unwrap();

        assert!(store.target_has_collection("c"));
        assert_eq!(store.target_documents("c").len(), 0);
        assert_eq!(store.target_indexes("c").len(), 1);
    }

    #[tokio::test]
    async fn copies_all_documents_in_batches() {
        let store = Arc::new(FakeStoreClient::new());
        let docs = vec![
            doc! { "_id": 1, "a": 1 },
            doc! { "_id": 2, "a": 2 },
            doc! { "_id": 3, "a": 3 },
        ];
        store.add_source_collection("c", docs.clone(), vec![]);
        let ctx = test_context(Arc::clone(&store), 4, false);

        copy_collections(&ctx, FailurePolicy::ContinueOnError)
            .await
            .unwrap();

        let mut target = store.target_documents("c");
        target.sort_by_key(|d| d.get_i32("_id").unwrap());
        assert_eq!(target, docs);
    }

    #[tokio::test]
    async fn index_set_equals_source_minus_id() {
        let store = Arc::new(FakeStoreClient::new());
        store.add_source_collection(
            "c",
            vec![doc! { "_id": 1 }],
            vec![IndexSpec {
                keys: vec![("a".to_string(), Bson::Int32(1)), ("_id".to_string(), Bson::Int32(1))],
                name: "ai".to_string(),
                options: doc! {},
            }],
        );
        let ctx = test_context(Arc::clone(&store), 1, false);

        copy_collections(&ctx, FailurePolicy::ContinueOnError)
            .await
            .unwrap();

        let indexes = store.target_indexes("c");
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "ai");
    }

    #[tokio::test]
    async fn continue_on_error_lets_siblings_finish() {
        let store = Arc::new(FakeStoreClient::new());
        store.add_source_collection("ok1", vec![doc! {"_id": 1}], vec![]);
        store.add_source_collection("broken", vec![doc! {"_id": 9}], vec![]);
        store.add_source_collection("ok2", vec![doc! {"_id": 2}], vec![]);
        store.fail_collection("broken");
        let ctx = test_context(Arc::clone(&store), 3, false);

        copy_collections(&ctx, FailurePolicy::ContinueOnError)
            .await
            .unwrap();

        assert_eq!(store.target_documents("ok1").len(), 1);
        assert_eq!(store.target_documents("ok2").len(), 1);
        assert!(store.target_documents("broken").is_empty());
    }

    #[tokio::test]
    async fn fail_fast_aborts_the_run_on_the_first_failed_collection() {
        let store = Arc::new(FakeStoreClient::new());
        store.add_source_collection("ok", vec![doc! {"_id": 1}], vec![]);
        store.add_source_collection("broken", vec![doc! {"_id": 9}], vec![]);
        store.fail_collection("broken");
        let ctx = test_context(Arc::clone(&store), 2, false);

        let err = copy_collections(&ctx, FailurePolicy::FailFast)
            .await
            .unwrap_err();

        assert!(matches!(err, MongosyncError::Snapshot { collection, .. } if collection == "broken"));
    }

    #[tokio::test]
    async fn view_recreation_drops_existing_then_creates() {
        let store = Arc::new(FakeStoreClient::new());
        store.add_source_view(ViewDescriptor {
            name: "v".to_string(),
            view_on: "c".to_string(),
            pipeline: vec![],
        });
        let ctx = test_context(Arc::clone(&store), 1, false);

        create_views(&ctx).await.unwrap();

        assert!(store.target_has_collection("v"));
    }

    #[test]
    fn ceil_percentage_rounds_up() {
        assert_eq!(ceil_percentage(1, 3), 34);
        assert_eq!(ceil_percentage(3, 3), 100);
        assert_eq!(ceil_percentage(0, 0), 100);
    }

    #[tokio::test]
    async fn capture_pre_snapshot_timestamp_fails_fatally_on_empty_oplog() {
        let store = Arc::new(FakeStoreClient::new());
        let ctx = test_context(Arc::clone(&store), 1, false);

        let err = capture_pre_snapshot_timestamp(&ctx).await.unwrap_err();
        assert!(matches!(err, MongosyncError::Oplog(_)));
    }

    #[tokio::test]
    async fn capture_pre_snapshot_timestamp_stores_result_on_context() {
        let store = Arc::new(FakeStoreClient::new());
        store.set_oplog_timestamp(ClusterTime::new(500, 2));
        let ctx = test_context(Arc::clone(&store), 1, false);

        capture_pre_snapshot_timestamp(&ctx).await.unwrap();
        assert_eq!(
            ctx.last_timestamp_from_oplog(),
            Some(ClusterTime::new(500, 2))
        );
    }
}
