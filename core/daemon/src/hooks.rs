//! User hook scripts fired on lifecycle events.
//!
//! For an event named `session:complete` the runner looks for an executable
//! `<state dir>/hooks/session-complete`. The event envelope is written to the
//! hook's stdin and `TEMPO_EVENT` carries the event name. Hooks run on their
//! own thread with a wall-clock bound; every failure is logged and dropped.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempo_daemon_protocol::DaemonEvent;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::HookConfig;

const POLL_INTERVAL_MS: u64 = 25;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Failed to spawn hook {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed while waiting for hook {path}: {source}")]
    Wait {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Hook {path} timed out after {timeout_ms} ms")]
    TimedOut { path: PathBuf, timeout_ms: u128 },

    #[error("Hook {path} exited with {status}")]
    Failed { path: PathBuf, status: ExitStatus },
}

pub struct HookRunner {
    dir: PathBuf,
    enabled: bool,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(dir: PathBuf, config: &HookConfig) -> Self {
        Self {
            dir,
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn apply_config(&mut self, config: &HookConfig) {
        self.enabled = config.enabled;
        self.timeout = Duration::from_secs(config.timeout_secs);
    }

    pub fn hook_path(&self, event_name: &str) -> PathBuf {
        self.dir.join(event_name.replace(':', "-"))
    }

    /// Fires the hook for `event` in the background, if one is installed.
    pub fn dispatch(&self, event: &DaemonEvent) {
        if !self.enabled || matches!(event, DaemonEvent::Tick(_)) {
            return;
        }
        let path = self.hook_path(event.name());
        if !is_executable(&path) {
            return;
        }
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, event = event.name(), "Failed to serialize hook payload");
                return;
            }
        };

        let event_name = event.name();
        let timeout = self.timeout;
        thread::spawn(move || {
            if let Err(err) = run_hook(&path, event_name, &payload, timeout) {
                warn!(error = %err, event = event_name, "Hook failed");
            }
        });
    }
}

fn is_executable(path: &Path) -> bool {
    fs_err::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn run_hook(
    path: &Path,
    event_name: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), HookError> {
    debug!(path = %path.display(), event = event_name, "Running hook");
    let mut child = Command::new(path)
        .env("TEMPO_EVENT", event_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| HookError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A hook that ignores stdin may exit before reading it.
        if let Err(err) = stdin.write_all(payload) {
            debug!(error = %err, "Hook did not consume stdin");
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                return Err(HookError::Failed {
                    path: path.to_path_buf(),
                    status,
                })
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HookError::TimedOut {
                    path: path.to_path_buf(),
                    timeout_ms: timeout.as_millis(),
                });
            }
            Ok(None) => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS)),
            Err(source) => {
                return Err(HookError::Wait {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}
