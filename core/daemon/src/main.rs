//! tempo daemon entrypoint.
//!
//! A single-writer service that owns the work/break timer for one user. It
//! listens on a Unix socket for newline-delimited JSON commands, pushes
//! lifecycle events to subscribers, persists a snapshot so a restart (or crash)
//! loses nothing, and appends finished sessions to the history log.

use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

mod config;
mod engine;
mod history;
mod hooks;
mod instance;
mod logging;
mod paths;
mod server;
mod snapshot;
mod status;
mod subscribers;

use config::{load_config, TimerConfig};
use engine::{SessionEngine, SystemClock};
use history::JsonlSessionLog;
use hooks::HookRunner;
use instance::InstanceError;
use paths::DaemonPaths;
use server::{Daemon, DaemonCore};
use snapshot::SnapshotStore;
use status::StatusFile;

fn main() {
    let paths = match DaemonPaths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("tempo-daemon: {}", err);
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(&paths.logs_dir());

    if let Err(err) = prepare_state_dir(paths.root()) {
        error!(error = %err, "Failed to prepare state directory");
        std::process::exit(1);
    }

    match instance::ensure_single_instance(&paths) {
        Ok(()) => {}
        Err(err @ InstanceError::AlreadyRunning { .. }) => {
            error!("{}", err);
            eprintln!("tempo-daemon: {}", err);
            std::process::exit(1);
        }
        Err(err) => {
            error!(error = %err, "Failed to clear previous daemon state");
            std::process::exit(1);
        }
    }

    if let Err(err) = instance::write_pid(&paths.pid_file()) {
        error!(error = %err, "Failed to write pid file");
        std::process::exit(1);
    }

    let socket_path = paths.socket();
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            instance::release_pid_file(&paths);
            std::process::exit(1);
        }
    };
    // Rewrite after bind so the file reflects the process that owns the socket.
    if let Err(err) = instance::write_pid(&paths.pid_file()) {
        warn!(error = %err, "Failed to refresh pid file");
    }

    let config = match load_config(&paths.config()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            TimerConfig::default()
        }
    };
    info!(
        work_minutes = config.work_minutes,
        short_break_minutes = config.short_break_minutes,
        long_break_minutes = config.long_break_minutes,
        long_break_interval = config.long_break_interval,
        strict_mode = config.strict_mode,
        sequences = config.sequences.len(),
        "Config loaded"
    );

    let hooks = HookRunner::new(paths.hooks_dir(), &config.hooks);
    let engine = restore_engine(&paths, config);
    let core = DaemonCore::new(engine, hooks, StatusFile::new(paths.status()));
    let daemon = Daemon::new(paths.clone(), core);
    daemon.publish_startup();
    spawn_signal_handler(Arc::clone(&daemon));

    info!(
        path = %socket_path.display(),
        pid = std::process::id(),
        "tempo daemon started"
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || daemon.handle_connection(stream));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn prepare_state_dir(root: &Path) -> Result<(), String> {
    fs_err::create_dir_all(root).map_err(|err| format!("Failed to create state directory: {}", err))
}

fn restore_engine(paths: &DaemonPaths, config: TimerConfig) -> SessionEngine {
    let store = SnapshotStore::new(paths.snapshot());
    let mut engine = SessionEngine::new(
        config,
        Box::new(SystemClock),
        store.clone(),
        Box::new(JsonlSessionLog::new(paths.history())),
    );

    match store.load() {
        Ok(Some(snapshot)) => {
            info!(
                session_type = snapshot.session_type.as_str(),
                running = snapshot.started_at.is_some(),
                paused = snapshot.is_paused,
                "Restoring timer snapshot"
            );
            engine.restore(snapshot);
            engine.restore_and_reconcile();
        }
        Ok(None) => {}
        Err(err) => {
            warn!(error = %err, path = %store.path().display(), "Failed to load timer snapshot; starting fresh");
        }
    }
    engine
}

fn spawn_signal_handler(daemon: Arc<Daemon>) {
    let mut signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
        Ok(signals) => signals,
        Err(err) => {
            warn!(error = %err, "Failed to install signal handlers");
            return;
        }
    };
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received termination signal");
            daemon.shutdown();
        }
    });
}
