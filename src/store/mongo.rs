//! `mongodb`-driver-backed implementation of [`StoreClient`].

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::{self, StreamExt, TryStreamExt};
use mongodb::options::{
    Acknowledgment, ChangeStreamOptions, ClientOptions, CreateIndexOptions, FindOptions,
    FullDocumentType, InsertManyOptions, ReplaceOptions, WriteConcern,
};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::config::{Config, WriteConcernLevel};
use crate::timestamp::ClusterTime;

use super::{
    BatchStream, ChangeEvent, ChangeStreamCursor, ChangeStreamHandle, IndexSpec, OperationType,
    StoreClient, ViewDescriptor,
};

pub struct MongoStoreClient {
    source_client: Client,
    target_client: Client,
    source_db: Database,
    target_db: Database,
    database: String,
    write_concern: WriteConcern,
}

impl MongoStoreClient {
    pub async fn connect(config: &Config) -> anyhow::Result<MongoStoreClient> {
        log::debug!(
            "connecting to source {}:{}",
            config.source.hostname,
            config.source.port
        );
        let source_client = connect_one(&config.source.connection_string())
            .await
            .context("connecting to source")?;

        log::debug!(
            "connecting to target {}:{}",
            config.target.hostname,
            config.target.port
        );
        let target_client = connect_one(&config.target.connection_string())
            .await
            .context("connecting to target")?;

        let source_db = source_client.database(&config.database);
        let target_db = target_client.database(&config.database);
        let write_concern = to_write_concern(&config.change_stream.write_concern)?;

        Ok(MongoStoreClient {
            source_client,
            target_client,
            source_db,
            target_db,
            database: config.database.clone(),
            write_concern,
        })
    }

    /// Exposed so the binary entry point can hand the same target
    /// connection to [`crate::checkpoint::MongoCheckpointStore`] instead of
    /// opening a second pool.
    pub fn target_client(&self) -> &Client {
        &self.target_client
    }

    fn target_collection(&self, name: &str) -> Collection<Document> {
        self.target_db.collection::<Document>(name)
    }

    fn source_collection(&self, name: &str) -> Collection<Document> {
        self.source_db.collection::<Document>(name)
    }
}

async fn connect_one(uri: &str) -> anyhow::Result<Client> {
    let options = ClientOptions::parse(uri).await?;
    Client::with_options(options).map_err(Into::into)
}

fn to_write_concern(level: &WriteConcernLevel) -> anyhow::Result<WriteConcern> {
    let acknowledgment = match level {
        WriteConcernLevel::Acknowledgment(n) => Acknowledgment::Nodes(*n as u32),
        WriteConcernLevel::Tag(tag) if tag == "majority" => Acknowledgment::Majority,
        WriteConcernLevel::Tag(tag) => Acknowledgment::Custom(tag.clone()),
    };
    Ok(WriteConcern::builder().w(acknowledgment).build())
}

#[async_trait]
impl StoreClient for MongoStoreClient {
    async fn target_database_exists(&self) -> anyhow::Result<bool> {
        let names = self.target_client.list_database_names(None, None).await?;
        Ok(names.iter().any(|name| name == &self.database))
    }

    async fn list_source_collections(&self) -> anyhow::Result<Vec<String>> {
        let filter = doc! {
            "type": "collection",
            "name": { "$nin": ["system.profile", "system.views"] },
        };
        let names = self
            .source_db
            .list_collection_names(Some(filter))
            .await?;
        Ok(names)
    }

    async fn list_source_views(&self) -> anyhow::Result<Vec<ViewDescriptor>> {
        let result = self
            .source_db
            .run_command(doc! { "listCollections": 1, "filter": { "type": "view" } }, None)
            .await?;

        let batch = result
            .get_document("cursor")
            .and_then(|cursor| cursor.get_array("firstBatch"))
            .map_err(|err| anyhow!("unexpected listCollections reply shape: {}", err))?;

        let mut views = Vec::with_capacity(batch.len());
        for entry in batch {
            let doc = entry
                .as_document()
                .ok_or_else(|| anyhow!("listCollections entry is not a document"))?;
            let name = doc
                .get_str("name")
                .map_err(|_| anyhow!("view entry missing 'name'"))?
                .to_string();
            let options = doc
                .get_document("options")
                .map_err(|_| anyhow!("view '{}' missing 'options'", name))?;
            let view_on = options
                .get_str("viewOn")
                .map_err(|_| anyhow!("view '{}' missing 'viewOn'", name))?
                .to_string();
            let pipeline = options
                .get_array("pipeline")
                .map(|arr| {
                    arr.iter()
                        .filter_map(|b| b.as_document().cloned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            views.push(ViewDescriptor {
                name,
                view_on,
                pipeline,
            });
        }

        Ok(views)
    }

    async fn estimated_source_count(&self, collection: &str) -> anyhow::Result<u64> {
        Ok(self.source_collection(collection).estimated_document_count(None).await?)
    }

    async fn estimated_target_count(&self, collection: &str) -> anyhow::Result<u64> {
        Ok(self.target_collection(collection).estimated_document_count(None).await?)
    }

    async fn read_source_batches(
        &self,
        collection: &str,
        batch_size: u32,
    ) -> anyhow::Result<BatchStream> {
        let options = FindOptions::builder().batch_size(batch_size).build();
        let cursor = self
            .source_collection(collection)
            .find(None, options)
            .await?;

        // The driver yields one decoded `Document` at a time; we re-chunk
        // into `batch_size`-sized groups at the application level so the
        // snapshot engine's per-batch progress logging reflects real batch
        // boundaries without holding the whole collection in memory at once.
        let batch_size = batch_size as usize;
        let chunked = stream::unfold(
            (cursor, false),
            move |(mut cursor, exhausted)| async move {
                if exhausted {
                    return None;
                }

                let mut batch = Vec::with_capacity(batch_size);
                loop {
                    match cursor.try_next().await {
                        Ok(Some(doc)) => {
                            batch.push(doc);
                            if batch.len() >= batch_size {
                                return Some((Ok(batch), (cursor, false)));
                            }
                        }
                        Ok(None) => {
                            let exhausted = true;
                            if batch.is_empty() {
                                return None;
                            }
                            return Some((Ok(batch), (cursor, exhausted)));
                        }
                        Err(err) => return Some((Err(anyhow!(err)), (cursor, true))),
                    }
                }
            },
        );

        Ok(Box::pin(chunked))
    }

    async fn insert_target_placeholder(&self, collection: &str) -> anyhow::Result<()> {
        let coll = self.target_collection(collection);
        let inserted = coll.insert_one(doc! {}, None).await?;
        coll.delete_one(doc! { "_id": inserted.inserted_id }, None)
            .await?;
        Ok(())
    }

    async fn bulk_insert_target(&self, collection: &str, docs: Vec<Document>) -> anyhow::Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let options = InsertManyOptions::builder()
            .write_concern(self.write_concern.clone())
            .build();
        self.target_collection(collection)
            .insert_many(docs, options)
            .await?;
        Ok(())
    }

    async fn list_source_indexes(&self, collection: &str) -> anyhow::Result<Vec<IndexSpec>> {
        let mut cursor = self.source_collection(collection).list_indexes(None).await?;
        let mut specs = Vec::new();

        while let Some(model) = cursor.try_next().await? {
            let name = model
                .options
                .as_ref()
                .and_then(|opts| opts.name.clone())
                .unwrap_or_default();

            if name == "_id_" {
                continue;
            }

            let keys: Vec<(String, Bson)> = model.keys.into_iter().collect();

            // options minus {key, ns}: IndexModel separates keys already,
            // so serializing IndexOptions back to a Document naturally
            // excludes `key`/`ns`/`name` (name is tracked out-of-band above).
            let mut options_doc = Document::new();
            if let Some(opts) = model.options {
                if let Ok(bson::Bson::Document(d)) = bson::to_bson(&opts) {
                    options_doc = d;
                }
                options_doc.remove("name");
            }

            specs.push(IndexSpec {
                keys,
                name,
                options: options_doc,
            });
        }

        Ok(specs)
    }

    async fn create_target_index(&self, collection: &str, index: &IndexSpec) -> anyhow::Result<()> {
        let keys: Document = index.keys.iter().cloned().collect();
        let mut options: mongodb::options::IndexOptions = bson::from_document(index.options.clone())
            .unwrap_or_default();
        options.name = Some(index.name.clone());

        let model = IndexModel::builder().keys(keys).options(options).build();
        let create_options = CreateIndexOptions::builder().build();

        self.target_collection(collection)
            .create_index(model, create_options)
            .await?;
        Ok(())
    }

    async fn target_collection_exists(&self, name: &str) -> anyhow::Result<bool> {
        let names = self
            .target_db
            .list_collection_names(Some(doc! { "name": name }))
            .await?;
        Ok(!names.is_empty())
    }

    async fn drop_target_collection(&self, name: &str) -> anyhow::Result<()> {
        self.target_collection(name).drop(None).await?;
        Ok(())
    }

    async fn create_target_view(&self, view: &ViewDescriptor) -> anyhow::Result<()> {
        if self.target_collection_exists(&view.name).await? {
            self.drop_target_collection(&view.name).await?;
        }

        self.target_db
            .run_command(
                doc! {
                    "create": &view.name,
                    "viewOn": &view.view_on,
                    "pipeline": view.pipeline.clone(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn last_oplog_timestamp(&self) -> anyhow::Result<Option<ClusterTime>> {
        let local = self.source_client.database("local");
        let oplog = local.collection::<Document>("oplog.rs");
        let options = FindOptions::builder()
            .sort(doc! { "$natural": -1 })
            .limit(1)
            .build();

        let mut cursor = oplog.find(None, options).await?;
        if let Some(doc) = cursor.try_next().await? {
            let ts = doc
                .get_timestamp("ts")
                .map_err(|_| anyhow!("oplog entry missing 'ts'"))?;
            Ok(Some(ts.into()))
        } else {
            Ok(None)
        }
    }

    async fn open_change_stream(&self, start_at: ClusterTime) -> anyhow::Result<ChangeStreamHandle> {
        let options = ChangeStreamOptions::builder()
            .start_at_operation_time(start_at.into())
            .full_document(FullDocumentType::UpdateLookup)
            .build();

        let stream = self
            .source_db
            .watch(Vec::<Document>::new(), options)
            .await
            .map_err(classify_change_stream_open_error)?;

        Ok(Box::new(MongoChangeStream { stream }))
    }

    async fn replace_target_document(
        &self,
        collection: &str,
        id: &Bson,
        document: Document,
        upsert: bool,
    ) -> anyhow::Result<()> {
        let options = ReplaceOptions::builder()
            .upsert(upsert)
            .write_concern(self.write_concern.clone())
            .build();
        self.target_collection(collection)
            .replace_one(doc! { "_id": id.clone() }, document, options)
            .await?;
        Ok(())
    }

    async fn set_target_fields(
        &self,
        collection: &str,
        id: &Bson,
        fields: Document,
    ) -> anyhow::Result<()> {
        let options = mongodb::options::UpdateOptions::builder()
            .write_concern(self.write_concern.clone())
            .build();
        self.target_collection(collection)
            .update_one(doc! { "_id": id.clone() }, doc! { "$set": fields }, options)
            .await?;
        Ok(())
    }

    async fn unset_target_field(&self, collection: &str, id: &Bson, field: &str) -> anyhow::Result<()> {
        let options = mongodb::options::UpdateOptions::builder()
            .write_concern(self.write_concern.clone())
            .build();
        self.target_collection(collection)
            .update_one(
                doc! { "_id": id.clone() },
                doc! { "$unset": { field: 1 } },
                options,
            )
            .await?;
        Ok(())
    }

    async fn delete_target_document(&self, collection: &str, id: &Bson) -> anyhow::Result<()> {
        let options = mongodb::options::DeleteOptions::builder()
            .write_concern(self.write_concern.clone())
            .build();
        self.target_collection(collection)
            .delete_one(doc! { "_id": id.clone() }, options)
            .await?;
        Ok(())
    }

    async fn rename_target_collection(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let admin = self.target_client.database("admin");
        let from_ns = format!("{}.{}", self.database, from);
        let to_ns = format!("{}.{}", self.database, to);

        let result = admin
            .run_command(
                doc! { "renameCollection": from_ns, "to": to_ns },
                None,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => bail!("rename '{}' -> '{}' failed: {}", from, to, err),
        }
    }

    async fn close(&self) {
        // The driver has no explicit disconnect; dropping the clients closes
        // their connection pools, which also terminates any open change
        // stream.
    }
}

fn classify_change_stream_open_error(err: mongodb::error::Error) -> anyhow::Error {
    let message = err.to_string();
    if message.contains("resume") || message.contains("ChangeStreamHistoryLost") {
        anyhow!("resume token expired or invalid: {}", message)
    } else {
        anyhow!(err)
    }
}

struct MongoChangeStream {
    stream: mongodb::change_stream::ChangeStream<
        mongodb::change_stream::event::ChangeStreamEvent<Document>,
    >,
}

#[async_trait]
impl ChangeStreamCursor for MongoChangeStream {
    async fn try_next(&mut self) -> anyhow::Result<Option<ChangeEvent>> {
        use mongodb::change_stream::event::OperationType as DriverOp;

        let event = match self.stream.try_next().await? {
            Some(event) => event,
            None => return Ok(None),
        };

        let cluster_time = event
            .cluster_time
            .ok_or_else(|| anyhow!("change-stream event missing clusterTime"))?
            .into();

        let collection = event
            .ns
            .as_ref()
            .and_then(|ns| ns.coll.clone())
            .unwrap_or_default();

        let document_id = event
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id").cloned());

        let operation_type = match event.operation_type {
            DriverOp::Insert => OperationType::Insert,
            DriverOp::Update => OperationType::Update,
            DriverOp::Replace => OperationType::Replace,
            DriverOp::Delete => OperationType::Delete,
            DriverOp::Rename => OperationType::Rename,
            DriverOp::Drop => OperationType::Drop,
            DriverOp::DropDatabase => OperationType::DropDatabase,
            other => OperationType::Other(format!("{:?}", other)),
        };

        let (updated_fields, removed_fields) = match event.update_description {
            Some(description) => (
                Some(description.updated_fields),
                description.removed_fields,
            ),
            None => (None, Vec::new()),
        };

        let rename_to_collection = event.rename_to.and_then(|ns| ns.coll);

        Ok(Some(ChangeEvent {
            operation_type,
            cluster_time,
            collection,
            document_id,
            full_document: event.full_document,
            updated_fields,
            removed_fields,
            rename_to_collection,
        }))
    }
}
