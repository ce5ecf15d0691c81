//! Daemon server: connections, command dispatch and timer threads.
//!
//! All engine access goes through one mutex around [`DaemonCore`]. The lock is
//! held across applying a command, broadcasting the events it produced and
//! enqueueing the direct response, so every client observes the same order:
//! events first, then the response.

use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tempo_daemon_protocol::{
    parse_command, Command, Response, ERROR_LINE_TOO_LONG, MAX_LINE_BYTES,
};
use tracing::{debug, info, warn};

use crate::config::load_config;
use crate::engine::{Sequence, SequenceError, SessionEngine, INLINE_SEQUENCE_NAME};
use crate::hooks::HookRunner;
use crate::instance;
use crate::paths::DaemonPaths;
use crate::status::StatusFile;
use crate::subscribers::{Outbound, SubscriberHub};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct DaemonCore {
    engine: SessionEngine,
    hub: SubscriberHub,
    hooks: HookRunner,
    status: StatusFile,
    heartbeat_spawned: Option<u64>,
    auto_start_spawned: Option<u64>,
}

impl DaemonCore {
    pub fn new(engine: SessionEngine, hooks: HookRunner, status: StatusFile) -> Self {
        Self {
            engine,
            hub: SubscriberHub::default(),
            hooks,
            status,
            heartbeat_spawned: None,
            auto_start_spawned: None,
        }
    }
}

enum Flow {
    Continue,
    Close,
    Exit,
}

enum LineError {
    TooLong,
    Io(std::io::Error),
}

pub struct Daemon {
    core: Mutex<DaemonCore>,
    paths: DaemonPaths,
    shutting_down: AtomicBool,
    next_connection: AtomicU64,
}

impl Daemon {
    pub fn new(paths: DaemonPaths, core: DaemonCore) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(core),
            paths,
            shutting_down: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
        })
    }

    fn lock_core(&self) -> MutexGuard<'_, DaemonCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flushes whatever startup reconciliation produced and writes the
    /// initial status file.
    pub fn publish_startup(self: &Arc<Self>) {
        let mut core = self.lock_core();
        self.after_engine_op(&mut core);
        let state = core.engine.state();
        if let Err(err) = core.status.write(&state) {
            warn!(error = %err, "Failed to write status file");
        }
    }

    pub fn handle_connection(self: &Arc<Self>, stream: UnixStream) {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let outbound = match Outbound::spawn(id, &stream) {
            Ok(outbound) => outbound,
            Err(err) => {
                warn!(error = %err, "Failed to set up connection writer");
                return;
            }
        };
        debug!(connection = id, "Connection opened");

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            match read_line(&mut reader, &mut line) {
                Ok(false) => break,
                Ok(true) => {}
                Err(LineError::TooLong) => {
                    warn!(connection = id, "Command line too long; dropping connection");
                    outbound.send(&Response::error(ERROR_LINE_TOO_LONG));
                    outbound.wait_flushed(FLUSH_TIMEOUT);
                    outbound.close();
                    break;
                }
                Err(LineError::Io(err)) => {
                    debug!(connection = id, error = %err, "Connection read failed");
                    break;
                }
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match self.handle_line(&line, &outbound) {
                Flow::Continue => {}
                Flow::Close => {
                    outbound.wait_flushed(FLUSH_TIMEOUT);
                    outbound.close();
                    break;
                }
                Flow::Exit => {
                    outbound.wait_flushed(FLUSH_TIMEOUT);
                    self.shutdown();
                    break;
                }
            }
        }

        self.lock_core().hub.remove(id);
        debug!(connection = id, "Connection closed");
    }

    fn handle_line(self: &Arc<Self>, line: &[u8], outbound: &Outbound) -> Flow {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => {
                debug!(connection = outbound.id(), error = %message, "Rejected command");
                outbound.send(&Response::error(message));
                return Flow::Continue;
            }
        };
        debug!(connection = outbound.id(), command = command.name(), "Command received");

        let mut core = self.lock_core();
        match command {
            Command::Subscribe => match core.hub.add(outbound.clone()) {
                Ok(()) => {
                    outbound.send(&Response::ok(core.engine.state()));
                    Flow::Continue
                }
                Err(err) => {
                    warn!(connection = outbound.id(), "Subscriber limit reached");
                    outbound.send(&Response::error(err.to_string()));
                    Flow::Close
                }
            },
            Command::Shutdown => {
                outbound.send(&Response::ok(core.engine.state()));
                Flow::Exit
            }
            command => {
                let result = self.apply(&mut core, command);
                self.after_engine_op(&mut core);
                let response = match result {
                    Ok(()) => Response::ok(core.engine.state()),
                    Err(message) => Response::error(message),
                };
                outbound.send(&response);
                Flow::Continue
            }
        }
    }

    fn apply(&self, core: &mut DaemonCore, command: Command) -> Result<(), String> {
        match command {
            Command::Start => core.engine.start(),
            Command::Pause => core.engine.pause(),
            Command::Resume => core.engine.resume(),
            Command::Toggle => core.engine.toggle(),
            Command::Skip => core.engine.skip(),
            Command::Reset => core.engine.reset(),
            Command::ResetLog { productive } => core.engine.reset_and_log(productive),
            Command::Abandon => core.engine.abandon(),
            Command::Status | Command::Ping => {}
            Command::SetProject { project } => core.engine.set_project(&project),
            Command::SetLabel { label } => core.engine.set_label(&label),
            Command::SetDuration { minutes } => core.engine.set_duration(minutes),
            Command::ActivateSequence { name } => {
                let definition = core
                    .engine
                    .config()
                    .sequences
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| SequenceError::UnknownName(name.clone()).to_string())?;
                let sequence = Sequence::parse(&name, &definition).map_err(|e| e.to_string())?;
                core.engine.activate_sequence(sequence);
            }
            Command::ActivateSequenceInline { definition } => {
                let sequence = Sequence::parse(INLINE_SEQUENCE_NAME, &definition)
                    .map_err(|e| e.to_string())?;
                core.engine.activate_sequence(sequence);
            }
            Command::ClearSequence => core.engine.clear_sequence(),
            Command::AdvanceSession => core.engine.advance_session(),
            Command::SwitchToStopwatch => core.engine.switch_to_stopwatch(),
            Command::StopStopwatch => core.engine.stop_stopwatch(),
            Command::UpdateConfig => {
                let config = load_config(&self.paths.config()).map_err(|e| e.to_string())?;
                info!("Config reloaded");
                core.hooks.apply_config(&config.hooks);
                core.engine.update_config(config);
            }
            Command::Subscribe | Command::Shutdown => {}
        }
        Ok(())
    }

    /// Fans out queued events and starts any timer threads the engine armed.
    fn after_engine_op(self: &Arc<Self>, core: &mut DaemonCore) {
        let events = core.engine.drain_events();
        let mut refresh_status = false;
        for event in &events {
            let dropped = core.hub.broadcast(event);
            if dropped > 0 {
                debug!(dropped, event = event.name(), "Subscribers dropped during broadcast");
            }
            core.hooks.dispatch(event);
            refresh_status |= event.refreshes_status();
        }
        if refresh_status {
            if let Err(err) = core.status.write(&core.engine.state()) {
                warn!(error = %err, "Failed to write status file");
            }
        }

        if let Some(generation) = core.engine.heartbeat_generation() {
            if core.heartbeat_spawned != Some(generation) {
                core.heartbeat_spawned = Some(generation);
                self.spawn_heartbeat(generation);
            }
        }
        if let Some(token) = core.engine.pending_auto_start() {
            if core.auto_start_spawned != Some(token) {
                core.auto_start_spawned = Some(token);
                self.spawn_auto_start(token);
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64) {
        let daemon = Arc::clone(self);
        thread::spawn(move || {
            let mut next = Instant::now() + HEARTBEAT_INTERVAL;
            loop {
                thread::sleep(next.saturating_duration_since(Instant::now()));
                next += HEARTBEAT_INTERVAL;
                if !daemon.heartbeat(generation) {
                    break;
                }
            }
            debug!(generation, "Heartbeat stopped");
        });
    }

    fn heartbeat(self: &Arc<Self>, generation: u64) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut core = self.lock_core();
        if core.engine.heartbeat_generation() != Some(generation) {
            return false;
        }
        core.engine.tick();
        self.after_engine_op(&mut core);
        true
    }

    /// Runs after the completing operation releases the lock, so clients see
    /// the idle state before the next session starts.
    fn spawn_auto_start(self: &Arc<Self>, token: u64) {
        let daemon = Arc::clone(self);
        thread::spawn(move || {
            if daemon.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let mut core = daemon.lock_core();
            core.engine.run_auto_start(token);
            daemon.after_engine_op(&mut core);
        });
    }

    /// Persists final state and removes runtime files. Returns false if a
    /// shutdown was already in progress.
    pub fn stop(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut core = self.lock_core();
            info!(subscribers = core.hub.len(), "Daemon shutting down");
            core.engine.dispose();
            core.hub.close_all();
            core.status.remove();
        }
        instance::remove_runtime_files(&self.paths);
        true
    }

    pub fn shutdown(&self) {
        if self.stop() {
            std::process::exit(0);
        }
    }
}

/// Reads one newline-terminated line into `buf`, without the newline.
/// Returns `Ok(false)` at end of stream.
fn read_line(reader: &mut BufReader<UnixStream>, buf: &mut Vec<u8>) -> Result<bool, LineError> {
    buf.clear();
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(LineError::Io(err)),
        };
        if available.is_empty() {
            return Ok(!buf.is_empty());
        }

        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            buf.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            if buf.len() > MAX_LINE_BYTES {
                return Err(LineError::TooLong);
            }
            return Ok(true);
        }

        let len = available.len();
        buf.extend_from_slice(available);
        reader.consume(len);
        if buf.len() > MAX_LINE_BYTES {
            return Err(LineError::TooLong);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerConfig;
    use crate::engine::SystemClock;
    use crate::history::JsonlSessionLog;
    use crate::snapshot::SnapshotStore;
    use serde_json::Value;
    use std::io::Write;
    use tempfile::TempDir;

    struct TestClient {
        writer: UnixStream,
        reader: BufReader<UnixStream>,
    }

    impl TestClient {
        fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).expect("write");
            self.writer.write_all(b"\n").expect("write newline");
        }

        fn recv(&mut self) -> Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).expect("read line");
            serde_json::from_str(&line).expect("json line")
        }

        fn request(&mut self, line: &str) -> Value {
            self.send(line);
            self.recv()
        }
    }

    fn daemon(dir: &TempDir, config: TimerConfig) -> Arc<Daemon> {
        let paths = DaemonPaths::at(dir.path().to_path_buf());
        let engine = SessionEngine::new(
            config.clone(),
            Box::new(SystemClock),
            SnapshotStore::new(paths.snapshot()),
            Box::new(JsonlSessionLog::new(paths.history())),
        );
        let core = DaemonCore::new(
            engine,
            HookRunner::new(paths.hooks_dir(), &config.hooks),
            StatusFile::new(paths.status()),
        );
        let daemon = Daemon::new(paths, core);
        daemon.publish_startup();
        daemon
    }

    fn connect(daemon: &Arc<Daemon>) -> TestClient {
        let (server, client) = UnixStream::pair().expect("socket pair");
        let daemon = Arc::clone(daemon);
        thread::spawn(move || daemon.handle_connection(server));
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        TestClient {
            writer: client.try_clone().expect("clone"),
            reader: BufReader::new(client),
        }
    }

    #[test]
    fn status_returns_full_state() {
        let dir = tempfile::tempdir().expect("temp dir");
        let daemon = daemon(&dir, TimerConfig::default());
        let mut client = connect(&daemon);

        let response = client.request(r#"{"cmd":"status"}"#);
        assert_eq!(response["ok"], true);
        assert_eq!(response["state"]["secondsLeft"], 1500);
        assert_eq!(response["state"]["sessionType"], "work");
        assert!(dir.path().join("status.json").exists());
    }

    #[test]
    fn malformed_input_keeps_connection_open() {
        let dir = tempfile::tempdir().expect("temp dir");
        let daemon = daemon(&dir, TimerConfig::default());
        let mut client = connect(&daemon);

        let response = client.request("{ nope");
        assert_eq!(response["ok"], false);
        assert!(response["error"]
            .as_str()
            .unwrap_or_default()
            .starts_with("invalid JSON"));

        let response = client.request(r#"{"cmd":"set-duration","minutes":500}"#);
        assert_eq!(response["ok"], false);

        let response = client.request(r#"{"cmd":"ping"}"#);
        assert_eq!(response["ok"], true);
    }

    #[test]
    fn events_precede_response_on_subscribed_connection() {
        let dir = tempfile::tempdir().expect("temp dir");
        let daemon = daemon(&dir, TimerConfig::default());
        let mut client = connect(&daemon);

        let response = client.request(r#"{"cmd":"subscribe"}"#);
        assert_eq!(response["ok"], true);

        client.send(r#"{"cmd":"set-label","label":"review"}"#);
        let event = client.recv();
        assert_eq!(event["event"], "state:change");
        assert_eq!(event["data"]["label"], "review");
        let response = client.recv();
        assert_eq!(response["ok"], true);
        assert_eq!(response["state"]["label"], "review");
    }

    #[test]
    fn unknown_and_inline_sequences() {
        let dir = tempfile::tempdir().expect("temp dir");
        let daemon = daemon(&dir, TimerConfig::default());
        let mut client = connect(&daemon);

        let response = client.request(r#"{"cmd":"activate-sequence","name":"nope"}"#);
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "unknown sequence: nope");

        let response =
            client.request(r#"{"cmd":"activate-sequence-inline","definition":"45w 15l"}"#);
        assert_eq!(response["ok"], true);
        assert_eq!(response["state"]["totalSeconds"], 2700);
        assert_eq!(response["state"]["sequence"]["name"], "inline");
    }

    #[test]
    fn oversized_line_is_rejected_and_connection_dropped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let daemon = daemon(&dir, TimerConfig::default());
        let mut client = connect(&daemon);

        let big = "x".repeat(MAX_LINE_BYTES + 10);
        let _ = client.writer.write_all(big.as_bytes());
        let response = client.recv();
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], ERROR_LINE_TOO_LONG);

        let mut rest = String::new();
        let read = client.reader.read_line(&mut rest).unwrap_or(0);
        assert_eq!(read, 0);
    }

    #[test]
    fn stop_disposes_engine_and_removes_runtime_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let daemon = daemon(&dir, TimerConfig::default());
        let paths = DaemonPaths::at(dir.path().to_path_buf());
        instance::write_pid(&paths.pid_file()).expect("pid");

        let mut client = connect(&daemon);
        assert_eq!(client.request(r#"{"cmd":"start"}"#)["ok"], true);

        assert!(daemon.stop());
        assert!(!daemon.stop());
        assert!(!paths.status().exists());
        assert!(!paths.pid_file().exists());

        let snapshot = SnapshotStore::new(paths.snapshot())
            .load()
            .expect("load")
            .expect("snapshot");
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.intervals.iter().all(|i| i.end.is_some()));
    }
}
