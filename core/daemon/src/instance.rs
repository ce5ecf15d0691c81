//! Single-instance guard.
//!
//! A leftover socket file is only trusted after a real connection attempt: a
//! live daemon answers, a crashed one leaves a file that refuses connections.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::paths::DaemonPaths;

pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("another tempo-daemon is already running (pid {pid})")]
    AlreadyRunning { pid: String },

    #[error("Failed to remove stale socket {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Returns true when something accepts connections on `path` within `timeout`.
pub fn probe_socket(path: &Path, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    let path = path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(UnixStream::connect(&path).is_ok());
    });
    rx.recv_timeout(timeout).unwrap_or(false)
}

/// Fails if a live daemon owns the socket; removes a stale socket file otherwise.
pub fn ensure_single_instance(paths: &DaemonPaths) -> Result<(), InstanceError> {
    let socket = paths.socket();
    if fs_err::symlink_metadata(&socket).is_err() {
        return Ok(());
    }

    if probe_socket(&socket, PROBE_TIMEOUT) {
        let pid = read_pid(&paths.pid_file())
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(InstanceError::AlreadyRunning { pid });
    }

    info!(path = %socket.display(), "Removing stale daemon socket");
    match fs_err::remove_file(&socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(InstanceError::StaleSocket {
            path: socket,
            source,
        }),
    }
}

pub fn read_pid(path: &Path) -> Option<u32> {
    fs_err::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

pub fn write_pid(path: &Path) -> Result<(), InstanceError> {
    let pid_err = |source| InstanceError::PidFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(pid_err)?;
    }
    fs_err::write(path, format!("{}\n", std::process::id())).map_err(pid_err)
}

/// Removes the socket, and the PID file if it still names this process.
/// Only the process that bound the socket may call this.
pub fn remove_runtime_files(paths: &DaemonPaths) {
    remove_quietly(&paths.socket());
    release_pid_file(paths);
}

/// Removes the PID file if it still names this process. Used when the bind
/// fails: the socket then belongs to whichever daemon won the race.
pub fn release_pid_file(paths: &DaemonPaths) {
    if read_pid(&paths.pid_file()) == Some(std::process::id()) {
        remove_quietly(&paths.pid_file());
    }
}

fn remove_quietly(path: &Path) {
    match fs_err::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, "Failed to remove runtime file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn probe_fails_for_missing_socket() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        assert!(!probe_socket(
            &temp_dir.path().join("daemon.sock"),
            PROBE_TIMEOUT
        ));
    }

    #[test]
    fn live_socket_is_reported_with_pid() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths::at(temp_dir.path().to_path_buf());
        let _listener = UnixListener::bind(paths.socket()).expect("bind");
        fs_err::write(paths.pid_file(), "4242\n").expect("write pid");

        let err = ensure_single_instance(&paths).unwrap_err();
        assert_eq!(
            err.to_string(),
            "another tempo-daemon is already running (pid 4242)"
        );
        assert!(paths.socket().exists());
    }

    #[test]
    fn stale_socket_is_removed() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths::at(temp_dir.path().to_path_buf());
        drop(UnixListener::bind(paths.socket()).expect("bind"));
        assert!(paths.socket().exists());

        ensure_single_instance(&paths).expect("stale socket cleared");
        assert!(!paths.socket().exists());
    }

    #[test]
    fn pid_file_is_only_removed_when_owned() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths::at(temp_dir.path().to_path_buf());

        write_pid(&paths.pid_file()).expect("write pid");
        assert_eq!(read_pid(&paths.pid_file()), Some(std::process::id()));
        remove_runtime_files(&paths);
        assert!(!paths.pid_file().exists());

        fs_err::write(paths.pid_file(), "1\n").expect("write foreign pid");
        remove_runtime_files(&paths);
        assert!(paths.pid_file().exists());
    }

    #[test]
    fn losing_bind_race_leaves_winner_socket_alone() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths::at(temp_dir.path().to_path_buf());

        write_pid(&paths.pid_file()).expect("write pid");
        let _winner = UnixListener::bind(paths.socket()).expect("winner bind");
        let loser = UnixListener::bind(paths.socket());
        assert_eq!(
            loser.err().map(|err| err.kind()),
            Some(std::io::ErrorKind::AddrInUse)
        );

        release_pid_file(&paths);
        assert!(paths.socket().exists());
        assert!(probe_socket(&paths.socket(), PROBE_TIMEOUT));
        assert!(!paths.pid_file().exists());

        fs_err::write(paths.pid_file(), "4242\n").expect("winner pid");
        release_pid_file(&paths);
        assert_eq!(read_pid(&paths.pid_file()), Some(4242));
        assert!(paths.socket().exists());
    }
}
