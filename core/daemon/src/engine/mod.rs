//! Session engine: the timer/session state machine.
//!
//! The engine is sans-IO with respect to sockets and threads. It owns the
//! authoritative in-memory timer state, queues lifecycle events for the server
//! to drain, appends finished sessions to the history log and persists a
//! snapshot after every state-changing operation.
//!
//! Timers are requested, not run: `start` arms a heartbeat generation and a
//! completion may leave an auto-start token pending. The server turns those
//! into threads and calls back into `tick` / `run_auto_start`; a stale
//! generation or token is simply ignored, which makes cancellation immediate.
//!
//! ## State transitions
//!
//! ```text
//! idle --start--> running --pause--> paused --start--> running
//! running --tick to zero / stop-stopwatch--> complete (advanced, idle)
//! running|paused --skip / reset / abandon / reset-log--> idle
//! ```

mod clock;
mod sequence;

pub use clock::{Clock, SystemClock};
pub use sequence::{Sequence, SequenceError, INLINE_SEQUENCE_NAME};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tempo_daemon_protocol::{
    is_valid_duration, DaemonEvent, EngineFullState, Session, SessionStartPayload, SessionStatus,
    SessionType, SequenceAdvancePayload, SequenceCompletePayload, SkipPayload, TickPayload,
    TimerMode, TimerPayload, WorkInterval,
};
use tracing::{debug, info, warn};

use crate::config::TimerConfig;
use crate::history::SessionLog;
use crate::snapshot::{SnapshotStore, TimerSnapshot, SNAPSHOT_VERSION};
use sequence::ActiveSequence;

/// Attempts shorter than this leave no session record.
pub const MIN_LOGGED_SECS: u64 = 10;

pub struct SessionEngine {
    config: TimerConfig,
    clock: Box<dyn Clock>,
    store: SnapshotStore,
    history: Box<dyn SessionLog>,

    mode: TimerMode,
    seconds_left: u32,
    total_seconds: u32,
    stopwatch_elapsed: u32,
    running: bool,
    paused: bool,
    complete: bool,

    session_type: SessionType,
    session_number: u32,
    total_work_sessions: u32,
    label: Option<String>,
    project: Option<String>,
    override_minutes: Option<f64>,
    sequence: Option<ActiveSequence>,

    started_at: Option<DateTime<Utc>>,
    intervals: Vec<WorkInterval>,

    heartbeat: Option<u64>,
    auto_start: Option<u64>,
    last_token: u64,
    events: Vec<DaemonEvent>,
}

impl SessionEngine {
    pub fn new(
        config: TimerConfig,
        clock: Box<dyn Clock>,
        store: SnapshotStore,
        history: Box<dyn SessionLog>,
    ) -> Self {
        let mut engine = Self {
            config,
            clock,
            store,
            history,
            mode: TimerMode::Countdown,
            seconds_left: 0,
            total_seconds: 0,
            stopwatch_elapsed: 0,
            running: false,
            paused: false,
            complete: false,
            session_type: SessionType::Work,
            session_number: 1,
            total_work_sessions: 0,
            label: None,
            project: None,
            override_minutes: None,
            sequence: None,
            started_at: None,
            intervals: Vec::new(),
            heartbeat: None,
            auto_start: None,
            last_token: 0,
            events: Vec::new(),
        };
        engine.reset_timer();
        engine
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> EngineFullState {
        EngineFullState {
            timer_mode: self.mode,
            seconds_left: self.seconds_left,
            total_seconds: self.total_seconds,
            stopwatch_elapsed: self.stopwatch_elapsed,
            is_running: self.running,
            is_paused: self.paused,
            is_complete: self.complete,
            session_type: self.session_type,
            session_number: self.session_number,
            total_work_sessions: self.total_work_sessions,
            label: self.label.clone(),
            project: self.project.clone(),
            override_duration: self.override_minutes,
            started_at: self.started_at,
            strict_mode: self.config.strict_mode,
            sequence: self.sequence.as_ref().map(ActiveSequence::to_state),
        }
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    /// Generation of the currently armed heartbeat, if any.
    pub fn heartbeat_generation(&self) -> Option<u64> {
        self.heartbeat
    }

    /// Token of a deferred auto-start waiting to run, if any.
    pub fn pending_auto_start(&self) -> Option<u64> {
        self.auto_start
    }

    pub fn drain_events(&mut self) -> Vec<DaemonEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn start(&mut self) {
        if self.running && !self.paused {
            return;
        }
        let now = self.clock.now();
        self.auto_start = None;

        if self.paused {
            let elapsed = self.elapsed_in_attempt();
            self.paused = false;
            self.started_at = Some(now - Duration::seconds(i64::from(elapsed)));
            self.open_interval(now);
            self.arm_heartbeat();
            self.emit(DaemonEvent::Resume(self.timer_payload()));
        } else {
            self.running = true;
            self.complete = false;
            self.started_at = Some(now);
            self.intervals = vec![WorkInterval::open(now)];
            self.arm_heartbeat();
            let payload = self.start_payload();
            debug!(
                session_type = self.session_type.as_str(),
                duration_seconds = payload.duration_seconds,
                "Session started"
            );
            self.emit(DaemonEvent::SessionStart(payload.clone()));
            if self.session_type.is_break() {
                self.emit(DaemonEvent::BreakStart(payload));
            }
        }

        self.emit_state_change();
        self.persist();
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.start();
        }
    }

    pub fn toggle(&mut self) {
        if self.running && !self.paused {
            self.pause();
        } else {
            self.start();
        }
    }

    pub fn pause(&mut self) {
        if !self.running || self.paused || self.config.strict_mode {
            return;
        }
        let now = self.clock.now();
        self.close_interval(now);
        self.paused = true;
        self.heartbeat = None;
        self.emit(DaemonEvent::Pause(self.timer_payload()));
        self.emit_state_change();
        self.persist();
    }

    pub fn skip(&mut self) {
        if self.config.strict_mode || self.mode == TimerMode::Stopwatch {
            return;
        }
        let now = self.clock.now();
        self.heartbeat = None;

        let session = if self.running {
            self.close_interval(now);
            let session = self.build_session(SessionStatus::Skipped, now);
            if let Some(session) = &session {
                self.log_session(session);
            }
            session
        } else {
            None
        };
        self.emit(DaemonEvent::SessionSkip(SkipPayload {
            session_type: self.session_type,
            session,
        }));

        self.advance();
        self.emit_state_change();
        self.persist();
    }

    /// Silent restart of the current session type; nothing is logged.
    pub fn reset(&mut self) {
        self.reset_timer();
        self.emit_state_change();
        self.persist();
    }

    pub fn reset_and_log(&mut self, productive: bool) {
        if self.running {
            let now = self.clock.now();
            self.close_interval(now);
            let accumulated = self.accumulated_secs();
            if accumulated >= MIN_LOGGED_SECS {
                let status = if productive {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Abandoned
                };
                if let Some(session) = self.build_session(status, now) {
                    self.log_session(&session);
                    self.emit(match status {
                        SessionStatus::Completed => DaemonEvent::SessionComplete(session),
                        _ => DaemonEvent::SessionAbandon(session),
                    });
                }
            } else {
                debug!(accumulated, "Attempt too short to log; discarding");
            }
        }
        self.reset();
    }

    pub fn abandon(&mut self) {
        if self.running {
            let now = self.clock.now();
            self.close_interval(now);
            if self.accumulated_secs() > 0 {
                if let Some(session) = self.build_session(SessionStatus::Abandoned, now) {
                    self.log_session(&session);
                    self.emit(DaemonEvent::SessionAbandon(session));
                }
            }
        }
        self.reset();
    }

    pub fn set_duration(&mut self, minutes: f64) {
        if !is_valid_duration(minutes) {
            return;
        }
        self.override_minutes = Some(minutes);
        self.reset_timer();
        self.emit_state_change();
        self.persist();
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = normalize_tag(label);
        self.emit_state_change();
        self.persist();
    }

    pub fn set_project(&mut self, project: &str) {
        self.project = normalize_tag(project);
        self.emit_state_change();
        self.persist();
    }

    pub fn activate_sequence(&mut self, sequence: Sequence) {
        let active = ActiveSequence::new(sequence);
        if let Some(block) = active.current() {
            self.session_type = block.session_type;
            self.override_minutes = Some(block.duration_minutes);
        }
        info!(
            name = %active.name,
            blocks = active.blocks.len(),
            "Sequence activated"
        );
        self.sequence = Some(active);
        self.reset_timer();
        self.emit_state_change();
        self.persist();
    }

    pub fn clear_sequence(&mut self) {
        if self.sequence.take().is_none() {
            return;
        }
        self.override_minutes = None;
        if !self.running {
            self.reset_timer();
        }
        self.emit_state_change();
        self.persist();
    }

    /// Moves to the next session without logging; only applies while idle.
    pub fn advance_session(&mut self) {
        if self.running {
            return;
        }
        self.advance();
        self.emit_state_change();
        self.persist();
    }

    pub fn switch_to_stopwatch(&mut self) {
        if self.mode == TimerMode::Stopwatch {
            return;
        }
        self.stopwatch_elapsed = if self.running {
            self.total_seconds.saturating_sub(self.seconds_left)
        } else {
            0
        };
        self.mode = TimerMode::Stopwatch;
        self.emit_state_change();
        self.persist();
    }

    pub fn stop_stopwatch(&mut self) {
        if self.mode != TimerMode::Stopwatch {
            return;
        }
        self.heartbeat = None;
        if self.running {
            let now = self.clock.now();
            self.close_interval(now);
            if self.accumulated_secs() >= MIN_LOGGED_SECS {
                self.finish_completed(now, true);
                self.emit_state_change();
                self.persist();
                return;
            }
        }
        self.reset_timer();
        self.emit_state_change();
        self.persist();
    }

    pub fn update_config(&mut self, config: TimerConfig) {
        self.config = config;
        if !self.running && self.mode == TimerMode::Countdown {
            self.total_seconds = self.planned_seconds();
            self.seconds_left = self.total_seconds;
        }
        self.emit_state_change();
        self.persist();
    }

    /// Heartbeat body; one call per elapsed second while running.
    pub fn tick(&mut self) {
        if self.heartbeat.is_none() || !self.running || self.paused {
            return;
        }
        match self.mode {
            TimerMode::Countdown => {
                self.seconds_left = self.seconds_left.saturating_sub(1);
                self.emit(DaemonEvent::Tick(self.tick_payload()));
                if self.seconds_left == 0 {
                    let now = self.clock.now();
                    self.finish_completed(now, true);
                    self.emit_state_change();
                    self.persist();
                }
            }
            TimerMode::Stopwatch => {
                self.stopwatch_elapsed = self.stopwatch_elapsed.saturating_add(1);
                self.emit(DaemonEvent::Tick(self.tick_payload()));
            }
        }
    }

    pub fn run_auto_start(&mut self, token: u64) {
        if self.auto_start != Some(token) || self.running {
            return;
        }
        self.auto_start = None;
        self.start();
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Loads persisted state into a freshly constructed engine.
    pub fn restore(&mut self, snapshot: TimerSnapshot) {
        self.session_type = snapshot.session_type;
        self.session_number = snapshot.session_number.max(1);
        self.total_work_sessions = snapshot.total_work_sessions;
        self.label = snapshot.label;
        self.project = snapshot.project;
        self.override_minutes = snapshot.override_duration.filter(|m| is_valid_duration(*m));
        self.sequence = snapshot.sequence.and_then(ActiveSequence::from_state);
        self.reset_timer();
        self.mode = snapshot.timer_mode;
        self.stopwatch_elapsed = snapshot.stopwatch_elapsed;

        if let Some(started_at) = snapshot.started_at {
            self.running = true;
            self.started_at = Some(started_at);
            self.intervals = snapshot.intervals;
            if snapshot.is_paused {
                self.paused = true;
                self.seconds_left = snapshot
                    .seconds_left_if_paused
                    .unwrap_or(self.total_seconds)
                    .min(self.total_seconds);
                self.close_interval(snapshot.saved_at);
            }
        } else {
            self.stopwatch_elapsed = 0;
        }
    }

    /// Resolves a restored snapshot against elapsed wall-clock time.
    ///
    /// A countdown that ran out while no daemon was up is completed at
    /// `startedAt + planned` and logged; one with time left resumes ticking.
    /// Paused timers stay paused until an explicit `start`.
    pub fn restore_and_reconcile(&mut self) {
        if !self.running || self.paused {
            return;
        }
        let Some(started_at) = self.started_at else {
            return;
        };
        let now = self.clock.now();
        let elapsed = now.signed_duration_since(started_at).num_seconds().max(0);

        match self.mode {
            TimerMode::Stopwatch => {
                self.stopwatch_elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
                self.reopen_last_interval();
                self.arm_heartbeat();
            }
            TimerMode::Countdown => {
                let planned = i64::from(self.total_seconds);
                if elapsed >= planned {
                    let ended_at = started_at + Duration::seconds(planned);
                    info!(
                        session_type = self.session_type.as_str(),
                        started_at = %started_at.to_rfc3339(),
                        ended_at = %ended_at.to_rfc3339(),
                        "Timer expired while daemon was down; completing session"
                    );
                    self.reopen_last_interval();
                    self.close_interval(ended_at);
                    self.seconds_left = 0;
                    self.finish_completed(ended_at, false);
                } else {
                    self.seconds_left = u32::try_from(planned - elapsed).unwrap_or(0);
                    self.reopen_last_interval();
                    self.arm_heartbeat();
                    info!(
                        seconds_left = self.seconds_left,
                        "Resumed running timer from snapshot"
                    );
                }
            }
        }
        self.emit_state_change();
        self.persist();
    }

    /// Final persistence before exit. The open interval is closed for exit and
    /// reopened by reconciliation on the next start.
    pub fn dispose(&mut self) {
        self.heartbeat = None;
        self.auto_start = None;
        if self.running && !self.paused {
            let now = self.clock.now();
            self.close_interval(now);
        }
        self.persist();
    }

    // ── Internals ────────────────────────────────────────────────────

    fn advance(&mut self) {
        let finished = self.session_type;
        if finished == SessionType::Work {
            self.total_work_sessions += 1;
        } else {
            self.session_number += 1;
        }

        let mut next_block = None;
        let mut exhausted = None;
        if let Some(active) = self.sequence.as_mut() {
            if !active.completed {
                if active.index + 1 < active.blocks.len() {
                    active.index += 1;
                    next_block = Some((
                        active.name.clone(),
                        active.index,
                        active.blocks[active.index].clone(),
                    ));
                } else {
                    active.completed = true;
                    exhausted = Some(active.name.clone());
                }
            }
        }

        match next_block {
            Some((name, index, block)) => {
                self.session_type = block.session_type;
                self.override_minutes = Some(block.duration_minutes);
                self.emit(DaemonEvent::SequenceAdvance(SequenceAdvancePayload {
                    name,
                    index,
                    block,
                }));
            }
            None => {
                if let Some(name) = exhausted {
                    info!(name = %name, "Sequence complete");
                    self.emit(DaemonEvent::SequenceComplete(SequenceCompletePayload {
                        name,
                    }));
                }
                self.override_minutes = None;
                self.session_type = self.next_cycle_type(finished);
            }
        }

        self.reset_timer();
    }

    fn next_cycle_type(&self, finished: SessionType) -> SessionType {
        if finished.is_break() {
            return SessionType::Work;
        }
        let interval = self.config.long_break_interval.max(1);
        if self.total_work_sessions % interval == 0 {
            SessionType::LongBreak
        } else {
            SessionType::ShortBreak
        }
    }

    fn finish_completed(&mut self, ended_at: DateTime<Utc>, allow_auto_start: bool) {
        self.heartbeat = None;
        self.close_interval(ended_at);
        if let Some(session) = self.build_session(SessionStatus::Completed, ended_at) {
            self.log_session(&session);
            self.emit(DaemonEvent::SessionComplete(session));
        }
        self.advance();
        self.complete = true;
        if allow_auto_start && self.config.auto_starts(self.session_type) {
            self.auto_start = Some(self.next_token());
        }
    }

    /// Idle countdown for the current session type.
    fn reset_timer(&mut self) {
        self.heartbeat = None;
        self.auto_start = None;
        self.mode = TimerMode::Countdown;
        self.running = false;
        self.paused = false;
        self.complete = false;
        self.started_at = None;
        self.intervals.clear();
        self.stopwatch_elapsed = 0;
        self.total_seconds = self.planned_seconds();
        self.seconds_left = self.total_seconds;
    }

    fn planned_seconds(&self) -> u32 {
        let minutes = self
            .override_minutes
            .unwrap_or_else(|| self.config.minutes_for(self.session_type));
        minutes_to_seconds(minutes)
    }

    fn elapsed_in_attempt(&self) -> u32 {
        match self.mode {
            TimerMode::Countdown => self.total_seconds.saturating_sub(self.seconds_left),
            TimerMode::Stopwatch => self.stopwatch_elapsed,
        }
    }

    fn open_interval(&mut self, now: DateTime<Utc>) {
        if self.intervals.iter().any(WorkInterval::is_open) {
            return;
        }
        self.intervals.push(WorkInterval::open(now));
    }

    fn close_interval(&mut self, at: DateTime<Utc>) {
        if let Some(last) = self.intervals.last_mut() {
            if last.end.is_none() {
                last.end = Some(at.max(last.start));
            }
        }
    }

    fn reopen_last_interval(&mut self) {
        match self.intervals.last_mut() {
            Some(last) => last.end = None,
            None => {
                if let Some(started_at) = self.started_at {
                    self.intervals.push(WorkInterval::open(started_at));
                }
            }
        }
    }

    fn accumulated_secs(&self) -> u64 {
        self.intervals.iter().map(WorkInterval::span_seconds).sum()
    }

    fn build_session(&self, status: SessionStatus, ended_at: DateTime<Utc>) -> Option<Session> {
        let started_at = self
            .intervals
            .first()
            .map(|interval| interval.start)
            .or(self.started_at)?;
        let duration_actual = self.accumulated_secs();
        let duration_planned = match self.mode {
            TimerMode::Countdown => u64::from(self.total_seconds),
            TimerMode::Stopwatch => duration_actual,
        };
        Some(Session {
            id: make_session_id(ended_at),
            session_type: self.session_type,
            status,
            label: self.label.clone(),
            project: self.project.clone(),
            duration_planned,
            duration_actual,
            started_at,
            ended_at,
            intervals: self.intervals.clone(),
        })
    }

    fn log_session(&self, session: &Session) {
        info!(
            id = %session.id,
            session_type = session.session_type.as_str(),
            status = ?session.status,
            duration_actual = session.duration_actual,
            "Session logged"
        );
        if let Err(err) = self.history.append(session) {
            warn!(error = %err, "Failed to append session to history");
        }
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.to_snapshot()) {
            warn!(error = %err, path = %self.store.path().display(), "Failed to persist timer snapshot");
        }
    }

    fn to_snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            version: SNAPSHOT_VERSION,
            session_type: self.session_type,
            session_number: self.session_number,
            total_work_sessions: self.total_work_sessions,
            label: self.label.clone(),
            project: self.project.clone(),
            override_duration: self.override_minutes,
            started_at: if self.running { self.started_at } else { None },
            is_paused: self.paused,
            seconds_left_if_paused: self.paused.then_some(self.seconds_left),
            timer_mode: self.mode,
            stopwatch_elapsed: self.stopwatch_elapsed,
            sequence: self.sequence.as_ref().map(ActiveSequence::to_state),
            intervals: self.intervals.clone(),
            saved_at: self.clock.now(),
        }
    }

    fn arm_heartbeat(&mut self) {
        self.heartbeat = Some(self.next_token());
    }

    fn next_token(&mut self) -> u64 {
        self.last_token += 1;
        self.last_token
    }

    fn emit(&mut self, event: DaemonEvent) {
        self.events.push(event);
    }

    fn emit_state_change(&mut self) {
        let state = self.state();
        self.emit(DaemonEvent::StateChange(Box::new(state)));
    }

    fn start_payload(&self) -> SessionStartPayload {
        SessionStartPayload {
            session_type: self.session_type,
            session_number: self.session_number,
            duration_seconds: self.total_seconds,
            label: self.label.clone(),
            project: self.project.clone(),
        }
    }

    fn timer_payload(&self) -> TimerPayload {
        TimerPayload {
            seconds_left: self.seconds_left,
            stopwatch_elapsed: self.stopwatch_elapsed,
        }
    }

    fn tick_payload(&self) -> TickPayload {
        TickPayload {
            session_type: self.session_type,
            timer_mode: self.mode,
            seconds_left: self.seconds_left,
            stopwatch_elapsed: self.stopwatch_elapsed,
        }
    }
}

fn minutes_to_seconds(minutes: f64) -> u32 {
    (minutes * 60.0).round().max(1.0) as u32
}

fn normalize_tag(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn make_session_id(at: DateTime<Utc>) -> String {
    let mut random = rand::thread_rng();
    format!("ses-{}-{:08x}", at.timestamp_millis(), random.next_u32())
}
