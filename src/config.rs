//! Typed YAML configuration: loads and validates the replication job's
//! config file into a typed tree instead of a loosely-typed map.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::MongosyncError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: String,
    pub source: Endpoint,
    pub target: Endpoint,
    #[serde(rename = "initialLoad")]
    pub initial_load: InitialLoadConfig,
    #[serde(rename = "changeStream")]
    pub change_stream: ChangeStreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Endpoint {
    /// Authenticates against the admin database.
    pub fn connection_string(&self) -> String {
        format!(
            "mongodb://{}:{}@{}:{}/?authSource=admin",
            self.username, self.password, self.hostname, self.port
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitialLoadConfig {
    #[serde(rename = "batchSize")]
    pub batch_size: u32,
    #[serde(rename = "maxWorkers")]
    pub max_workers: usize,
    /// Explicit policy knob for per-collection snapshot failures; defaults
    /// to "continue on error" so one broken collection doesn't abort the
    /// whole run.
    #[serde(rename = "failFast", default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeStreamConfig {
    pub resume: bool,
    #[serde(rename = "writeConcern")]
    pub write_concern: WriteConcernLevel,
    #[serde(rename = "checkpointBatchSize")]
    pub checkpoint_batch_size: u64,
    #[serde(rename = "checkpointTimeInterval")]
    pub checkpoint_time_interval: f64,
}

/// `changeStream.writeConcern` may be either a string or an integer —
/// modeled as an untagged enum so both `w: 1` and `w: "majority"` parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WriteConcernLevel {
    Acknowledgment(i32),
    Tag(String),
}

impl Config {
    /// Loads and validates the configuration file. Configuration errors
    /// (missing file, parse failure, empty content) are reported and
    /// returned before any network I/O is attempted.
    pub fn load(path: &Path) -> Result<Config, MongosyncError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            MongosyncError::Config(format!(
                "configuration file '{}' does not exist or is unreadable: {}",
                path.display(),
                err
            ))
        })?;

        if contents.trim().is_empty() {
            return Err(MongosyncError::Config(
                "the configuration file is empty or invalid".to_string(),
            ));
        }

        let config: Config = serde_yaml::from_str(&contents).map_err(|err| {
            MongosyncError::Config(format!("error parsing YAML file: {}", err))
        })?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), MongosyncError> {
        if self.database.trim().is_empty() {
            return Err(MongosyncError::Config(
                "'database' must not be empty".to_string(),
            ));
        }
        if self.initial_load.max_workers == 0 {
            return Err(MongosyncError::Config(
                "'initialLoad.maxWorkers' must be at least 1".to_string(),
            ));
        }
        if self.initial_load.batch_size == 0 {
            return Err(MongosyncError::Config(
                "'initialLoad.batchSize' must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
database: shop
source:
  hostname: src.example.com
  port: 27017
  username: repl
  password: secret
target:
  hostname: tgt.example.com
  port: 27017
  username: repl
  password: secret
initialLoad:
  batchSize: 1000
  maxWorkers: 4
changeStream:
  resume: false
  writeConcern: majority
  checkpointBatchSize: 500
  checkpointTimeInterval: 30
"#
    }

    #[test]
    fn parses_full_document() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.database, "shop");
        assert_eq!(config.initial_load.max_workers, 4);
        assert!(!config.change_stream.resume);
        assert!(!config.initial_load.fail_fast);
        match config.change_stream.write_concern {
            WriteConcernLevel::Tag(ref s) => assert_eq!(s, "majority"),
            _ => panic!("expected tag write concern"),
        }
    }

    #[test]
    fn numeric_write_concern_parses() {
        let yaml = sample_yaml().replace("writeConcern: majority", "writeConcern: 1");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        match config.change_stream.write_concern {
            WriteConcernLevel::Acknowledgment(n) => assert_eq!(n, 1),
            _ => panic!("expected numeric write concern"),
        }
    }

    #[test]
    fn rejects_empty_content() {
        let dir = std::env::temp_dir().join(format!("mongosyncdb-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("empty.yaml");
        std::fs::write(&file, "").unwrap();

        let err = Config::load(&file).unwrap_err();
        assert!(matches!(err, MongosyncError::Config(_)));
    }

    #[test]
    fn rejects_missing_file() {
        let err = Config::load(Path::new("/nonexistent/mongosyncdb.yaml")).unwrap_err();
        assert!(matches!(err, MongosyncError::Config(_)));
    }
}
