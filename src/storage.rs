//! JSON-file run-log
//!
//! Completed runs are kept newest-first in a single pretty-printed JSON
//! array. Writes go through a temporary file and a rename, and are
//! serialized by an async mutex so concurrent sessions in one process do not
//! lose records.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default number of records returned by [`RunLog::list`]
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Error, Debug)]
pub enum RunLogError {
    #[error("run-log I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run-log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One saved run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: u64,
    pub topic: String,
    pub report: String,
    #[serde(default)]
    pub metadata: Value,
    /// RFC 3339 UTC timestamp
    pub ts: String,
}

/// Append-only store of completed runs.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a run and return the stored entry.
    pub async fn save(
        &self,
        topic: &str,
        report: &str,
        metadata: Value,
    ) -> Result<RunRecord, RunLogError> {
        let _guard = self.write_lock.lock().await;

        // Unreadable history is an error, never overwritten.
        let mut runs = self.load().await?;
        let id = runs.iter().map(|r| r.id).max().unwrap_or(0) + 1;

        let record = RunRecord {
            id,
            topic: topic.to_string(),
            report: report.to_string(),
            metadata: if metadata.is_null() { Value::Object(Default::default()) } else { metadata },
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        runs.insert(0, record.clone());
        self.store(&runs).await?;

        debug!(id, path = %self.path.display(), "Run saved");
        Ok(record)
    }

    /// Most recent runs first, at most `limit` of them.
    ///
    /// A file that cannot be read lists as empty.
    pub async fn list(&self, limit: usize) -> Vec<RunRecord> {
        let mut runs = self.load().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read run-log");
            Vec::new()
        });
        runs.truncate(limit);
        runs
    }

    /// A missing file is an empty log, and so is one holding invalid JSON.
    /// Any other I/O failure is an error.
    async fn load(&self) -> Result<Vec<RunRecord>, RunLogError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RunLogError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Run-log is not valid JSON, starting fresh");
            Vec::new()
        }))
    }

    async fn store(&self, runs: &[RunRecord]) -> Result<(), RunLogError> {
        let io_err = |source: std::io::Error| RunLogError::Io { path: self.path.clone(), source };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(runs)?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, json).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;

        Ok(())
    }
}
