//! On-disk timer snapshot used to survive daemon restarts.
//!
//! The snapshot is a projection of engine state: enough to rebuild it without
//! loss and to notice that a running timer expired while no daemon was up.
//! Writes go to a temp file in the same directory and are renamed into place,
//! so readers never observe a partial file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempo_daemon_protocol::{SequenceState, SessionType, TimerMode, WorkInterval};
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub version: u32,
    pub session_type: SessionType,
    pub session_number: u32,
    pub total_work_sessions: u32,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub override_duration: Option<f64>,
    /// Effective start of the in-flight session; `None` when idle.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub seconds_left_if_paused: Option<u32>,
    #[serde(default)]
    pub timer_mode: TimerMode,
    #[serde(default)]
    pub stopwatch_elapsed: u32,
    #[serde(default)]
    pub sequence: Option<SequenceState>,
    #[serde(default)]
    pub intervals: Vec<WorkInterval>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<TimerSnapshot>, SnapshotError> {
        let data = match fs_err::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Io {
                    context: "Failed to read timer snapshot".to_string(),
                    source,
                })
            }
        };

        let snapshot: TimerSnapshot =
            serde_json::from_slice(&data).map_err(|source| SnapshotError::Json {
                context: format!("Failed to parse {}", self.path.display()),
                source,
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &TimerSnapshot) -> Result<(), SnapshotError> {
        write_json_atomic(&self.path, snapshot)
    }
}

/// Serializes `value` and atomically replaces `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let content = serde_json::to_vec_pretty(value).map_err(|source| SnapshotError::Json {
        context: "Failed to serialize state".to_string(),
        source,
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir).map_err(|source| SnapshotError::Io {
        context: "Failed to create state directory".to_string(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| SnapshotError::Io {
        context: "Failed to create temp file".to_string(),
        source,
    })?;
    tmp.write_all(&content).map_err(|source| SnapshotError::Io {
        context: "Failed to write temp file".to_string(),
        source,
    })?;
    tmp.flush().map_err(|source| SnapshotError::Io {
        context: "Failed to flush temp file".to_string(),
        source,
    })?;
    tmp.persist(path).map_err(|err| SnapshotError::Io {
        context: format!("Failed to persist {}", path.display()),
        source: err.error,
    })?;
    Ok(())
}
