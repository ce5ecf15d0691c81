//! Boundary to the long-term session history store.
//!
//! The daemon only ever appends finished sessions; reading and aggregating
//! history belongs to other tools. The default store is a JSON-lines file.

use std::io::Write;
use std::path::PathBuf;
use tempo_daemon_protocol::Session;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to append session to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize session: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SessionLog: Send {
    fn append(&self, session: &Session) -> Result<(), HistoryError>;
}

pub struct JsonlSessionLog {
    path: PathBuf,
}

impl JsonlSessionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionLog for JsonlSessionLog {
    fn append(&self, session: &Session) -> Result<(), HistoryError> {
        let mut line = serde_json::to_vec(session)?;
        line.push(b'\n');

        let io_err = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(&line).map_err(io_err)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempo_daemon_protocol::{SessionStatus, SessionType, WorkInterval};

    fn session(id: &str) -> Session {
        let start = Utc::now();
        let end = start + Duration::seconds(90);
        Session {
            id: id.to_string(),
            session_type: SessionType::Work,
            status: SessionStatus::Completed,
            label: None,
            project: Some("tempo".to_string()),
            duration_planned: 1500,
            duration_actual: 90,
            started_at: start,
            ended_at: end,
            intervals: vec![WorkInterval {
                start,
                end: Some(end),
            }],
        }
    }

    #[test]
    fn appends_one_line_per_session() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("sessions.jsonl");
        let log = JsonlSessionLog::new(path.clone());

        log.append(&session("a")).expect("append a");
        log.append(&session("b")).expect("append b");

        let content = fs_err::read_to_string(&path).expect("read history");
        let ids: Vec<String> = content
            .lines()
            .map(|line| serde_json::from_str::<Session>(line).expect("parse line").id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
