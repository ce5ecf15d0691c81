//! Connection-less status projection for status bars and prompts.
//!
//! `status.json` mirrors the engine state after every tick or state change so
//! readers can poll a file instead of holding a socket open.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tempo_daemon_protocol::EngineFullState;
use tracing::warn;

use crate::snapshot::{write_json_atomic, SnapshotError};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusDocument<'a> {
    #[serde(flatten)]
    state: &'a EngineFullState,
    updated_at: DateTime<Utc>,
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write(&self, state: &EngineFullState) -> Result<(), SnapshotError> {
        write_json_atomic(
            &self.path,
            &StatusDocument {
                state,
                updated_at: Utc::now(),
            },
        )
    }

    pub fn remove(&self) {
        match fs_err::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "Failed to remove status file"),
        }
    }
}
