//! IPC protocol types and validation for tempo-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid commands and decode responses and events.
//!
//! Framing is newline-delimited JSON in both directions. Clients send one
//! command object per line, discriminated by `cmd`; the daemon answers each
//! with a [`Response`] and pushes [`DaemonEvent`]s to subscribed connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_LINE_BYTES: usize = 64 * 1024;
pub const MAX_DURATION_MINUTES: f64 = 180.0;
pub const MAX_TAG_CHARS: usize = 200;

pub const ERROR_SUBSCRIBER_LIMIT: &str = "subscriber limit reached";
pub const ERROR_LINE_TOO_LONG: &str = "command line exceeded maximum size";

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    Start,
    Pause,
    Resume,
    Toggle,
    Skip,
    Reset,
    ResetLog { productive: bool },
    Abandon,
    Status,
    SetProject { project: String },
    SetLabel { label: String },
    SetDuration { minutes: f64 },
    ActivateSequence { name: String },
    ActivateSequenceInline { definition: String },
    ClearSequence,
    AdvanceSession,
    SwitchToStopwatch,
    StopStopwatch,
    UpdateConfig,
    Subscribe,
    Ping,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Toggle => "toggle",
            Command::Skip => "skip",
            Command::Reset => "reset",
            Command::ResetLog { .. } => "reset-log",
            Command::Abandon => "abandon",
            Command::Status => "status",
            Command::SetProject { .. } => "set-project",
            Command::SetLabel { .. } => "set-label",
            Command::SetDuration { .. } => "set-duration",
            Command::ActivateSequence { .. } => "activate-sequence",
            Command::ActivateSequenceInline { .. } => "activate-sequence-inline",
            Command::ClearSequence => "clear-sequence",
            Command::AdvanceSession => "advance-session",
            Command::SwitchToStopwatch => "switch-to-stopwatch",
            Command::StopStopwatch => "stop-stopwatch",
            Command::UpdateConfig => "update-config",
            Command::Subscribe => "subscribe",
            Command::Ping => "ping",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Parses and validates one command line.
///
/// Every failure maps to a message suitable for an error response; nothing
/// here panics on untrusted input.
pub fn parse_command(line: &[u8]) -> Result<Command, String> {
    let value: Value =
        serde_json::from_slice(line).map_err(|err| format!("invalid JSON: {}", err))?;
    let object = value
        .as_object()
        .ok_or_else(|| "command must be a JSON object".to_string())?;

    let name = match object.get("cmd") {
        Some(Value::String(name)) => name.as_str(),
        Some(_) => return Err("cmd must be a string".to_string()),
        None => return Err("cmd is required".to_string()),
    };

    let command = match name {
        "start" => Command::Start,
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "toggle" => Command::Toggle,
        "skip" => Command::Skip,
        "reset" => Command::Reset,
        "reset-log" => Command::ResetLog {
            productive: require_bool(object, "productive")?,
        },
        "abandon" => Command::Abandon,
        "status" => Command::Status,
        "set-project" => Command::SetProject {
            project: require_tag(object, "project")?,
        },
        "set-label" => Command::SetLabel {
            label: require_tag(object, "label")?,
        },
        "set-duration" => Command::SetDuration {
            minutes: require_minutes(object, "minutes")?,
        },
        "activate-sequence" => Command::ActivateSequence {
            name: require_non_empty(object, "name")?,
        },
        "activate-sequence-inline" => Command::ActivateSequenceInline {
            definition: require_non_empty(object, "definition")?,
        },
        "clear-sequence" => Command::ClearSequence,
        "advance-session" => Command::AdvanceSession,
        "switch-to-stopwatch" => Command::SwitchToStopwatch,
        "stop-stopwatch" => Command::StopStopwatch,
        "update-config" => Command::UpdateConfig,
        "subscribe" => Command::Subscribe,
        "ping" => Command::Ping,
        "shutdown" => Command::Shutdown,
        other => return Err(format!("unknown command: {}", other)),
    };

    Ok(command)
}

fn require_bool(object: &Map<String, Value>, field: &str) -> Result<bool, String> {
    match object.get(field) {
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(format!("{} must be a boolean", field)),
        None => Err(format!("{} is required", field)),
    }
}

fn require_string<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, String> {
    match object.get(field) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(_) => Err(format!("{} must be a string", field)),
        None => Err(format!("{} is required", field)),
    }
}

fn require_non_empty(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    let value = require_string(object, field)?;
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    Ok(value.trim().to_string())
}

// Empty tags are allowed; they clear the current value.
fn require_tag(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    let value = require_string(object, field)?;
    if value.chars().count() > MAX_TAG_CHARS {
        return Err(format!(
            "{} must be {} characters or fewer",
            field, MAX_TAG_CHARS
        ));
    }
    Ok(value.trim().to_string())
}

fn require_minutes(object: &Map<String, Value>, field: &str) -> Result<f64, String> {
    let minutes = match object.get(field) {
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| format!("{} must be a finite number", field))?,
        Some(_) => return Err(format!("{} must be a number", field)),
        None => return Err(format!("{} is required", field)),
    };
    if !is_valid_duration(minutes) {
        return Err(format!(
            "{} must be greater than 0 and at most {}",
            field, MAX_DURATION_MINUTES
        ));
    }
    Ok(minutes)
}

/// Shared range check for planned durations, in minutes: `(0, 180]`.
pub fn is_valid_duration(minutes: f64) -> bool {
    minutes.is_finite() && minutes > 0.0 && minutes <= MAX_DURATION_MINUTES
}

// ═══════════════════════════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EngineFullState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(state: EngineFullState) -> Self {
        Self {
            ok: true,
            state: Some(state),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            state: None,
            error: Some(message.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared state types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Work,
    ShortBreak,
    LongBreak,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Work => "work",
            SessionType::ShortBreak => "short-break",
            SessionType::LongBreak => "long-break",
        }
    }

    pub fn is_break(&self) -> bool {
        !matches!(self, SessionType::Work)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Skipped,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerMode {
    #[default]
    Countdown,
    Stopwatch,
}

/// A contiguous running span. `end` is `None` while the span is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkInterval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl WorkInterval {
    pub fn open(start: DateTime<Utc>) -> Self {
        Self { start, end: None }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Whole seconds covered by a closed interval; open intervals count zero.
    pub fn span_seconds(&self) -> u64 {
        match self.end {
            Some(end) => end.signed_duration_since(self.start).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

/// One logged work/break attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub status: SessionStatus,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub duration_planned: u64,
    pub duration_actual: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub intervals: Vec<WorkInterval>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceBlock {
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub duration_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceState {
    pub name: String,
    pub blocks: Vec<SequenceBlock>,
    pub current_index: usize,
    pub completed: bool,
}

/// Full transient engine state, returned with every successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineFullState {
    pub timer_mode: TimerMode,
    pub seconds_left: u32,
    pub total_seconds: u32,
    pub stopwatch_elapsed: u32,
    pub is_running: bool,
    pub is_paused: bool,
    pub is_complete: bool,
    pub session_type: SessionType,
    pub session_number: u32,
    pub total_work_sessions: u32,
    pub label: Option<String>,
    pub project: Option<String>,
    pub override_duration: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub strict_mode: bool,
    pub sequence: Option<SequenceState>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickPayload {
    pub session_type: SessionType,
    pub timer_mode: TimerMode,
    pub seconds_left: u32,
    pub stopwatch_elapsed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartPayload {
    pub session_type: SessionType,
    pub session_number: u32,
    pub duration_seconds: u32,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipPayload {
    pub session_type: SessionType,
    #[serde(default)]
    pub session: Option<Session>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceAdvancePayload {
    pub name: String,
    pub index: usize,
    pub block: SequenceBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceCompletePayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPayload {
    pub seconds_left: u32,
    pub stopwatch_elapsed: u32,
}

/// Lifecycle events pushed to subscribers as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DaemonEvent {
    #[serde(rename = "tick")]
    Tick(TickPayload),
    #[serde(rename = "state:change")]
    StateChange(Box<EngineFullState>),
    #[serde(rename = "session:start")]
    SessionStart(SessionStartPayload),
    #[serde(rename = "session:complete")]
    SessionComplete(Session),
    #[serde(rename = "session:skip")]
    SessionSkip(SkipPayload),
    #[serde(rename = "session:abandon")]
    SessionAbandon(Session),
    #[serde(rename = "break:start")]
    BreakStart(SessionStartPayload),
    #[serde(rename = "sequence:advance")]
    SequenceAdvance(SequenceAdvancePayload),
    #[serde(rename = "sequence:complete")]
    SequenceComplete(SequenceCompletePayload),
    #[serde(rename = "timer:pause")]
    Pause(TimerPayload),
    #[serde(rename = "timer:resume")]
    Resume(TimerPayload),
}

impl DaemonEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonEvent::Tick(_) => "tick",
            DaemonEvent::StateChange(_) => "state:change",
            DaemonEvent::SessionStart(_) => "session:start",
            DaemonEvent::SessionComplete(_) => "session:complete",
            DaemonEvent::SessionSkip(_) => "session:skip",
            DaemonEvent::SessionAbandon(_) => "session:abandon",
            DaemonEvent::BreakStart(_) => "break:start",
            DaemonEvent::SequenceAdvance(_) => "sequence:advance",
            DaemonEvent::SequenceComplete(_) => "sequence:complete",
            DaemonEvent::Pause(_) => "timer:pause",
            DaemonEvent::Resume(_) => "timer:resume",
        }
    }

    /// Events after which the connection-less status file should be refreshed.
    pub fn refreshes_status(&self) -> bool {
        matches!(self, DaemonEvent::Tick(_) | DaemonEvent::StateChange(_))
    }
}
