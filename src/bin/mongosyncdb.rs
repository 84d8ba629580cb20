//! Entry point: parses `--config-file`, wires up the store client, logger,
//! and checkpoint store, then runs the cutover controller to completion or
//! until a termination signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use mongosyncdb::checkpoint::MongoCheckpointStore;
use mongosyncdb::config::Config;
use mongosyncdb::context::RunContext;
use mongosyncdb::logger::Logger;
use mongosyncdb::store::MongoStoreClient;
use mongosyncdb::{cutover, shutdown, MongosyncError};

#[derive(Parser, Debug)]
#[clap(name = "mongosyncdb", about = "One-way MongoDB database replication")]
struct Args {
    /// Path to the YAML configuration file.
    #[clap(long = "config-file")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    match run(&args.config_file).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mongosyncdb: {}", err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(config_path: &PathBuf) -> Result<(), MongosyncError> {
    let config = Config::load(config_path)?;
    let logger = Arc::new(Logger::new(&config.database)?);

    logger.log(format!(
        "starting mongosyncdb for database '{}'",
        config.database
    ));

    let store = MongoStoreClient::connect(&config)
        .await
        .map_err(|source| MongosyncError::Precondition(source.to_string()))?;
    let checkpoints = MongoCheckpointStore::with_default_write_concern(store.target_client());

    let ctx = RunContext::new(Arc::new(store), config, Arc::clone(&logger));

    let result = tokio::select! {
        result = cutover::run(&ctx, &checkpoints) => result,
        _ = shutdown::wait_for_signal(&ctx) => Ok(()),
    };

    ctx.shutdown().await;
    result
}
