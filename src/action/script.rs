// Motion scripts: named, looping keyframe timelines
use serde::{Deserialize, Serialize};

use crate::device::frame::{self, FRAME_LEN, MAX_SPEED};

/// One (direction, speed) setting, in effect until `end_tick`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyframe {
    pub direction: bool,
    pub speed: u8,
    /// Cumulative tick at which this keyframe ends (exclusive)
    pub end_tick: u64,
}

impl Keyframe {
    pub fn new(direction: bool, speed: u8, end_tick: u64) -> Self {
        Self {
            direction,
            speed,
            end_tick,
        }
    }

    /// Wire command for this keyframe
    pub fn command(&self) -> [u8; FRAME_LEN] {
        frame::frame(self.direction, self.speed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Script '{name}' has no keyframes")]
    Empty { name: String },

    #[error("Script '{name}' keyframe {index}: end tick {end_tick} must be greater than {previous}")]
    NotIncreasing {
        name: String,
        index: usize,
        end_tick: u64,
        previous: u64,
    },

    #[error("Script '{name}' keyframe {index}: speed {speed} exceeds {max}", max = MAX_SPEED)]
    SpeedOutOfRange { name: String, index: usize, speed: u8 },
}

/// Wire form of a script, validated into [`MotionScript`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScript {
    pub name: String,
    pub keyframes: Vec<Keyframe>,
}

/// An immutable, validated motion script
///
/// Keyframes are non-empty with strictly increasing end ticks starting above
/// zero, so the cycle length is always positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawScript", into = "RawScript")]
pub struct MotionScript {
    name: String,
    keyframes: Vec<Keyframe>,
}

impl MotionScript {
    pub fn new(name: impl Into<String>, keyframes: Vec<Keyframe>) -> Result<Self, ScriptError> {
        let name = name.into();
        if keyframes.is_empty() {
            return Err(ScriptError::Empty { name });
        }

        let mut previous = 0;
        for (index, kf) in keyframes.iter().enumerate() {
            if kf.end_tick <= previous {
                return Err(ScriptError::NotIncreasing {
                    name,
                    index,
                    end_tick: kf.end_tick,
                    previous,
                });
            }
            if kf.speed > MAX_SPEED {
                return Err(ScriptError::SpeedOutOfRange {
                    name,
                    index,
                    speed: kf.speed,
                });
            }
            previous = kf.end_tick;
        }

        Ok(Self { name, keyframes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    /// Ticks in one loop of the script
    pub fn cycle_length(&self) -> u64 {
        // Non-empty by construction
        self.keyframes.last().map_or(0, |kf| kf.end_tick)
    }

    /// Duration in ticks of the shortest keyframe
    pub fn min_span(&self) -> u64 {
        let mut previous = 0;
        self.keyframes
            .iter()
            .map(|kf| {
                let span = kf.end_tick - previous;
                previous = kf.end_tick;
                span
            })
            .min()
            .unwrap_or(0)
    }
}

impl TryFrom<RawScript> for MotionScript {
    type Error = ScriptError;

    fn try_from(raw: RawScript) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.keyframes)
    }
}

impl From<MotionScript> for RawScript {
    fn from(script: MotionScript) -> Self {
        Self {
            name: script.name,
            keyframes: script.keyframes,
        }
    }
}
