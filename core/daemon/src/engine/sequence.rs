//! Sequences: predefined block plans that override normal work/break cycling.
//!
//! Definitions are compact strings of `<minutes><kind>` tokens separated by
//! whitespace or commas, e.g. `"50w 10s 50w 20l"`.

use tempo_daemon_protocol::{is_valid_duration, SequenceBlock, SequenceState, SessionType};
use thiserror::Error;

const MAX_BLOCKS: usize = 64;
pub const INLINE_SEQUENCE_NAME: &str = "inline";

#[derive(Error, Debug, PartialEq)]
pub enum SequenceError {
    #[error("sequence definition is empty")]
    Empty,

    #[error("sequence has more than 64 blocks")]
    TooManyBlocks,

    #[error("invalid sequence block '{token}': {reason}")]
    InvalidBlock { token: String, reason: String },

    #[error("unknown sequence: {0}")]
    UnknownName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub name: String,
    pub blocks: Vec<SequenceBlock>,
}

impl Sequence {
    pub fn parse(name: &str, definition: &str) -> Result<Self, SequenceError> {
        let blocks = definition
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(parse_block)
            .collect::<Result<Vec<_>, _>>()?;

        if blocks.is_empty() {
            return Err(SequenceError::Empty);
        }
        if blocks.len() > MAX_BLOCKS {
            return Err(SequenceError::TooManyBlocks);
        }

        Ok(Self {
            name: name.to_string(),
            blocks,
        })
    }
}

fn parse_block(token: &str) -> Result<SequenceBlock, SequenceError> {
    let invalid = |reason: &str| SequenceError::InvalidBlock {
        token: token.to_string(),
        reason: reason.to_string(),
    };

    let split = token
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| invalid("missing block kind (w, s or l)"))?;
    let (minutes, kind) = token.split_at(split);

    let minutes: f64 = minutes
        .parse()
        .map_err(|_| invalid("duration must be a number of minutes"))?;
    if !is_valid_duration(minutes) {
        return Err(invalid("duration must be greater than 0 and at most 180"));
    }

    let session_type = match kind.to_ascii_lowercase().as_str() {
        "w" | "work" => SessionType::Work,
        "s" | "sb" | "short" => SessionType::ShortBreak,
        "l" | "lb" | "long" => SessionType::LongBreak,
        _ => return Err(invalid("block kind must be w, s or l")),
    };

    Ok(SequenceBlock {
        session_type,
        duration_minutes: minutes,
    })
}

/// Progress through the active sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSequence {
    pub name: String,
    pub blocks: Vec<SequenceBlock>,
    pub index: usize,
    pub completed: bool,
}

impl ActiveSequence {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            name: sequence.name,
            blocks: sequence.blocks,
            index: 0,
            completed: false,
        }
    }

    pub fn current(&self) -> Option<&SequenceBlock> {
        if self.completed {
            return None;
        }
        self.blocks.get(self.index)
    }

    pub fn from_state(state: SequenceState) -> Option<Self> {
        if state.blocks.is_empty() || state.current_index >= state.blocks.len() {
            return None;
        }
        Some(Self {
            name: state.name,
            blocks: state.blocks,
            index: state.current_index,
            completed: state.completed,
        })
    }

    pub fn to_state(&self) -> SequenceState {
        SequenceState {
            name: self.name.clone(),
            blocks: self.blocks.clone(),
            current_index: self.index,
            completed: self.completed,
        }
    }
}
