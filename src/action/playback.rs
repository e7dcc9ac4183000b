// Action playback: which keyframe is active at a given instant
//
// A cursor is just (script, start time). The active keyframe is recomputed
// from the clock on every query, so cursors are never mutated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::script::{Keyframe, MotionScript};
use crate::config::TICK;

/// A script playing since `started_at`, looping forever
#[derive(Debug, Clone)]
pub struct PlaybackCursor {
    script: Arc<MotionScript>,
    started_at: Instant,
}

impl PlaybackCursor {
    pub fn new(script: Arc<MotionScript>, started_at: Instant) -> Self {
        Self { script, started_at }
    }

    /// Start playing now
    pub fn start(script: Arc<MotionScript>) -> Self {
        Self::new(script, Instant::now())
    }

    pub fn script(&self) -> &Arc<MotionScript> {
        &self.script
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Position within the current cycle at `now`, in ticks
    ///
    /// # Panics
    /// If `now` is earlier than the start time.
    pub fn tick_at(&self, now: Instant) -> u64 {
        let elapsed = now.checked_duration_since(self.started_at).unwrap_or_else(|| {
            panic!(
                "playback clock went backwards: now is {:?} before start",
                self.started_at - now
            )
        });
        elapsed_to_tick(elapsed, self.script.cycle_length())
    }

    /// Index of the keyframe active at `now`
    ///
    /// # Panics
    /// If `now` is earlier than the start time, or no keyframe covers the
    /// computed tick.
    pub fn active_index(&self, now: Instant) -> usize {
        let tick = self.tick_at(now);
        let keyframes = self.script.keyframes();

        // Upper bound: first keyframe ending strictly after `tick`
        let index = keyframes.partition_point(|kf| kf.end_tick <= tick);
        assert!(
            index < keyframes.len(),
            "no active keyframe for tick {} in script '{}' (cycle length {})",
            tick,
            self.script.name(),
            self.script.cycle_length()
        );
        index
    }

    /// Keyframe active at `now`
    pub fn active_keyframe(&self, now: Instant) -> &Keyframe {
        &self.script.keyframes()[self.active_index(now)]
    }
}

fn elapsed_to_tick(elapsed: Duration, cycle_length: u64) -> u64 {
    let ticks = elapsed.as_nanos() / TICK.as_nanos();
    (ticks % u128::from(cycle_length)) as u64
}
