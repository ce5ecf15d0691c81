//! Timer configuration loaded from `config.toml`.
//!
//! The file is optional: a missing file yields defaults. Out-of-range values
//! are normalized with a warning instead of failing startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempo_daemon_protocol::{is_valid_duration, SessionType};
use thiserror::Error;
use tracing::warn;

const DEFAULT_WORK_MINUTES: f64 = 25.0;
const DEFAULT_SHORT_BREAK_MINUTES: f64 = 5.0;
const DEFAULT_LONG_BREAK_MINUTES: f64 = 15.0;
const DEFAULT_LONG_BREAK_INTERVAL: u32 = 4;
const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: DEFAULT_HOOK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub work_minutes: f64,
    pub short_break_minutes: f64,
    pub long_break_minutes: f64,
    /// Every Nth completed work session is followed by a long break.
    pub long_break_interval: u32,
    /// Disables pause and skip.
    pub strict_mode: bool,
    pub auto_start_breaks: bool,
    pub auto_start_work: bool,
    /// Named sequences, as inline definitions (`"50w 10s 50w 20l"`).
    pub sequences: BTreeMap<String, String>,
    pub hooks: HookConfig,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            work_minutes: DEFAULT_WORK_MINUTES,
            short_break_minutes: DEFAULT_SHORT_BREAK_MINUTES,
            long_break_minutes: DEFAULT_LONG_BREAK_MINUTES,
            long_break_interval: DEFAULT_LONG_BREAK_INTERVAL,
            strict_mode: false,
            auto_start_breaks: false,
            auto_start_work: false,
            sequences: BTreeMap::new(),
            hooks: HookConfig::default(),
        }
    }
}

impl TimerConfig {
    pub fn minutes_for(&self, session_type: SessionType) -> f64 {
        match session_type {
            SessionType::Work => self.work_minutes,
            SessionType::ShortBreak => self.short_break_minutes,
            SessionType::LongBreak => self.long_break_minutes,
        }
    }

    pub fn auto_starts(&self, session_type: SessionType) -> bool {
        if session_type.is_break() {
            self.auto_start_breaks
        } else {
            self.auto_start_work
        }
    }

    fn normalized(mut self) -> Self {
        let defaults = TimerConfig::default();
        for (field, value, fallback) in [
            ("work_minutes", &mut self.work_minutes, defaults.work_minutes),
            (
                "short_break_minutes",
                &mut self.short_break_minutes,
                defaults.short_break_minutes,
            ),
            (
                "long_break_minutes",
                &mut self.long_break_minutes,
                defaults.long_break_minutes,
            ),
        ] {
            if !is_valid_duration(*value) {
                warn!(field, value = *value, fallback, "Config duration out of range");
                *value = fallback;
            }
        }
        if self.long_break_interval == 0 {
            warn!("long_break_interval must be at least 1; using 1");
            self.long_break_interval = 1;
        }
        self
    }
}

pub fn load_config(path: &Path) -> Result<TimerConfig, ConfigError> {
    if !path.exists() {
        return Ok(TimerConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str::<TimerConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config.normalized())
}
