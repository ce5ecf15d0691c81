use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};
use tempo_daemon_protocol::{Response, SessionType};

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(dir: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_tempo-daemon"))
        .env("TEMPO_DIR", dir)
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn tempo-daemon")
}

fn socket_path(dir: &Path) -> PathBuf {
    dir.join("daemon.sock")
}

fn can_bind_socket(dir: &Path) -> bool {
    let probe_path = dir.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

struct Connection {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn open(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("Failed to set read timeout");
        Self {
            writer: stream.try_clone().expect("Failed to clone stream"),
            reader: BufReader::new(stream),
        }
    }

    fn send(&mut self, command: Value) {
        serde_json::to_writer(&mut self.writer, &command).expect("Failed to serialize command");
        self.writer.write_all(b"\n").expect("Failed to write command");
        self.writer.flush().ok();
    }

    fn read_value(&mut self) -> Value {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).expect("Failed to read line");
        assert!(n > 0, "daemon closed the connection");
        serde_json::from_str(&line).expect("Failed to parse JSON line")
    }

    fn request(&mut self, command: Value) -> Response {
        self.send(command);
        serde_json::from_value(self.read_value()).expect("Failed to parse response")
    }

    /// Reads lines until an event named `name` arrives, skipping ticks.
    fn wait_for_event(&mut self, name: &str) -> Value {
        loop {
            let value = self.read_value();
            if value.get("event").and_then(Value::as_str) == Some(name) {
                return value;
            }
        }
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        sleep(Duration::from_millis(25));
    }
    None
}

fn temp_state_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("Failed to create temp state dir")
}

#[test]
fn daemon_status_start_pause_and_shutdown_flow() {
    let dir = temp_state_dir("tempo-daemon-smoke-flow");
    if !can_bind_socket(dir.path()) {
        eprintln!("Skipping daemon smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(dir.path());
    let mut guard = DaemonGuard {
        child: spawn_daemon(dir.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(3));

    let mut conn = Connection::open(&socket);
    let status = conn.request(json!({"cmd": "status"}));
    assert!(status.ok, "status response was not ok");
    let state = status.state.expect("status carries state");
    assert!(!state.is_running);
    assert_eq!(state.seconds_left, 1500);
    assert_eq!(state.session_type, SessionType::Work);
    assert!(dir.path().join("status.json").exists());

    let started = conn.request(json!({"cmd": "start"}));
    assert!(started.ok);
    assert!(started.state.as_ref().map(|s| s.is_running).unwrap_or(false));

    let paused = conn.request(json!({"cmd": "pause"}));
    assert!(paused.state.as_ref().map(|s| s.is_paused).unwrap_or(false));

    let resumed = conn.request(json!({"cmd": "resume"}));
    assert!(!resumed.state.as_ref().map(|s| s.is_paused).unwrap_or(true));

    let labeled = conn.request(json!({"cmd": "set-label", "label": "smoke"}));
    assert_eq!(
        labeled.state.and_then(|s| s.label).as_deref(),
        Some("smoke")
    );

    let shutdown = conn.request(json!({"cmd": "shutdown"}));
    assert!(shutdown.ok, "shutdown response was not ok");

    let exit = wait_for_exit(&mut guard.child, Duration::from_secs(3)).expect("daemon exited");
    assert!(exit.success());
    assert!(!socket.exists());
    assert!(!dir.path().join("daemon.pid").exists());
    assert!(!dir.path().join("status.json").exists());

    let snapshot: Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("timer-state.json")).expect("snapshot written"),
    )
    .expect("snapshot JSON");
    assert!(snapshot["startedAt"].is_string());
    assert_eq!(snapshot["label"], "smoke");
}

#[test]
fn subscriber_receives_events_from_other_connections() {
    let dir = temp_state_dir("tempo-daemon-smoke-events");
    if !can_bind_socket(dir.path()) {
        eprintln!("Skipping subscriber smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(dir.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(dir.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(3));

    let mut subscriber = Connection::open(&socket);
    assert!(subscriber.request(json!({"cmd": "subscribe"})).ok);

    let mut control = Connection::open(&socket);
    assert!(control.request(json!({"cmd": "start"})).ok);

    let start = subscriber.wait_for_event("session:start");
    assert_eq!(start["data"]["sessionType"], "work");
    assert_eq!(start["data"]["durationSeconds"], 1500);
    let change = subscriber.wait_for_event("state:change");
    assert_eq!(change["data"]["isRunning"], true);

    let tick = subscriber.wait_for_event("tick");
    assert!(tick["data"]["secondsLeft"].as_u64().unwrap_or(1500) < 1500);

    assert!(control.request(json!({"cmd": "skip"})).ok);
    let skip = subscriber.wait_for_event("session:skip");
    assert_eq!(skip["data"]["session"]["status"], "skipped");
}

#[test]
fn restart_completes_timer_that_expired_while_daemon_was_down() {
    let dir = temp_state_dir("tempo-daemon-smoke-reconcile");
    if !can_bind_socket(dir.path()) {
        eprintln!("Skipping reconcile smoke test: unix socket binding not permitted in this environment.");
        return;
    }

    let now = Utc::now();
    let started_at = now - ChronoDuration::seconds(1500 + 5);
    let snapshot = json!({
        "version": 1,
        "sessionType": "work",
        "sessionNumber": 1,
        "totalWorkSessions": 0,
        "label": "offline",
        "startedAt": started_at.to_rfc3339(),
        "isPaused": false,
        "timerMode": "countdown",
        "stopwatchElapsed": 0,
        "intervals": [{"start": started_at.to_rfc3339(), "end": null}],
        "savedAt": (started_at + ChronoDuration::seconds(30)).to_rfc3339(),
    });
    fs::write(
        dir.path().join("timer-state.json"),
        serde_json::to_vec_pretty(&snapshot).expect("serialize snapshot"),
    )
    .expect("write snapshot");

    let socket = socket_path(dir.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(dir.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(3));

    let state = Connection::open(&socket)
        .request(json!({"cmd": "status"}))
        .state
        .expect("status carries state");
    assert!(!state.is_running);
    assert_eq!(state.session_type, SessionType::ShortBreak);
    assert_eq!(state.total_work_sessions, 1);

    let history = fs::read_to_string(dir.path().join("sessions.jsonl")).expect("history written");
    let sessions: Vec<Value> = history
        .lines()
        .map(|line| serde_json::from_str(line).expect("history line"))
        .collect();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["status"], "completed");
    assert_eq!(sessions[0]["label"], "offline");
    assert_eq!(sessions[0]["durationActual"], 1500);
}

/// Reads `state:change` events until one carries `label == last`, returning
/// the label/project pairs in arrival order.
fn collect_state_changes(mut conn: Connection, last: &str) -> Vec<(Value, Value)> {
    let mut seen = Vec::new();
    loop {
        let event = conn.wait_for_event("state:change");
        let label = event["data"]["label"].clone();
        let project = event["data"]["project"].clone();
        let done = label == last;
        seen.push((label, project));
        if done {
            return seen;
        }
    }
}

#[test]
fn concurrent_clients_see_consistent_ordering() {
    const CLIENTS: usize = 8;
    const COMMANDS_PER_CLIENT: usize = 10;

    let dir = temp_state_dir("tempo-daemon-smoke-concurrent");
    if !can_bind_socket(dir.path()) {
        eprintln!("Skipping concurrency smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(dir.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(dir.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(3));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mut subscriber = Connection::open(&socket);
            assert!(subscriber.request(json!({"cmd": "subscribe"})).ok);
            thread::spawn(move || collect_state_changes(subscriber, "done"))
        })
        .collect();

    let workers: Vec<_> = (0..CLIENTS)
        .map(|client| {
            let socket = socket.clone();
            thread::spawn(move || {
                let mut conn = Connection::open(&socket);
                for n in 0..COMMANDS_PER_CLIENT {
                    let tag = format!("c{client}-{n}");
                    let (command, field) = if n % 2 == 0 {
                        (json!({"cmd": "set-label", "label": tag}), "label")
                    } else {
                        (json!({"cmd": "set-project", "project": tag}), "project")
                    };
                    let response = conn.request(command);
                    assert!(response.ok, "{tag} rejected");
                    let state = response.state.expect("response carries state");
                    let applied = if field == "label" {
                        state.label
                    } else {
                        state.project
                    };
                    assert_eq!(applied.as_deref(), Some(tag.as_str()));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("client thread");
    }

    let mut control = Connection::open(&socket);
    assert!(control.request(json!({"cmd": "set-label", "label": "done"})).ok);

    let sequences: Vec<Vec<(Value, Value)>> = readers
        .into_iter()
        .map(|reader| reader.join().expect("subscriber thread"))
        .collect();
    assert_eq!(sequences[0], sequences[1], "subscribers disagree on event order");

    let events = &sequences[0];
    assert_eq!(events.len(), CLIENTS * COMMANDS_PER_CLIENT + 1);
    for client in 0..CLIENTS {
        let positions: Vec<usize> = (0..COMMANDS_PER_CLIENT)
            .map(|n| {
                let tag = Value::from(format!("c{client}-{n}"));
                let field = |pair: &(Value, Value)| {
                    if n % 2 == 0 {
                        pair.0.clone()
                    } else {
                        pair.1.clone()
                    }
                };
                // Tags are unique, so the first event carrying one is the
                // event its command produced.
                events
                    .iter()
                    .position(|pair| field(pair) == tag)
                    .unwrap_or_else(|| panic!("missing event for {tag}"))
            })
            .collect();
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "client {client} events out of order: {positions:?}"
        );
    }
}
