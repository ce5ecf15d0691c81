//! Well-known filesystem locations for the daemon.
//!
//! Everything lives under one per-user state directory so a test (or a second
//! account) can isolate a daemon by pointing `TEMPO_DIR` somewhere else.

use std::env;
use std::path::{Path, PathBuf};

const DIR_ENV: &str = "TEMPO_DIR";
const DEFAULT_DIR_NAME: &str = ".tempo";

const SOCKET_NAME: &str = "daemon.sock";
const PID_NAME: &str = "daemon.pid";
const SNAPSHOT_NAME: &str = "timer-state.json";
const STATUS_NAME: &str = "status.json";
const HISTORY_NAME: &str = "sessions.jsonl";
const CONFIG_NAME: &str = "config.toml";
const HOOKS_DIR_NAME: &str = "hooks";
const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, Clone)]
pub struct DaemonPaths {
    root: PathBuf,
}

impl DaemonPaths {
    pub fn resolve() -> Result<Self, String> {
        if let Ok(dir) = env::var(DIR_ENV) {
            if !dir.trim().is_empty() {
                return Ok(Self::at(PathBuf::from(dir)));
            }
        }
        let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
        Ok(Self::at(home.join(DEFAULT_DIR_NAME)))
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join(SOCKET_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_NAME)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join(SNAPSHOT_NAME)
    }

    pub fn status(&self) -> PathBuf {
        self.root.join(STATUS_NAME)
    }

    pub fn history(&self) -> PathBuf {
        self.root.join(HISTORY_NAME)
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_NAME)
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join(HOOKS_DIR_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR_NAME)
    }
}
