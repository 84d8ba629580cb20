//! Structured log sink keyed by database: an explicit collaborator passed
//! to every component that needs it, rather than a process-wide singleton.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::error::MongosyncError;

/// One file under `./log/<database>.log`, plus the standard console stream.
/// Each line is `<ISO-timestamp> - <message>`.
pub struct Logger {
    database: String,
    file: Mutex<fs::File>,
}

impl Logger {
    pub fn new(database: &str) -> Result<Logger, MongosyncError> {
        Self::with_log_dir(database, Path::new("./log"))
    }

    pub fn with_log_dir(database: &str, log_dir: &Path) -> Result<Logger, MongosyncError> {
        fs::create_dir_all(log_dir).map_err(|err| {
            MongosyncError::Config(format!(
                "unable to create log directory '{}': {}",
                log_dir.display(),
                err
            ))
        })?;

        let path: PathBuf = log_dir.join(format!("{}.log", database));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                MongosyncError::Config(format!(
                    "unable to open log file '{}': {}",
                    path.display(),
                    err
                ))
            })?;

        Ok(Logger {
            database: database.to_string(),
            file: Mutex::new(file),
        })
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let line = format!(
            "{} - {}",
            Local::now().to_rfc3339(),
            message.as_ref()
        );

        println!("{}", line);

        let mut file = self.file.lock().expect("log file mutex poisoned");
        // A log write failure must never abort synchronization; best effort.
        let _ = writeln!(file, "{}", line);
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_database_file() {
        let dir = std::env::temp_dir().join(format!("mongosyncdb-logger-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let logger = Logger::with_log_dir("shop", &dir).unwrap();
        logger.log("hello world");

        let contents = fs::read_to_string(dir.join("shop.log")).unwrap();
        assert!(contents.ends_with("hello world\n"));
        assert!(contents.contains(" - hello world"));
    }

    #[test]
    fn creates_log_directory_on_demand() {
        let dir = std::env::temp_dir().join(format!("mongosyncdb-logger-mkdir-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        assert!(!dir.exists());

        let _logger = Logger::with_log_dir("shop", &dir).unwrap();
        assert!(dir.exists());
    }
}
