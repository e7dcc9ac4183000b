// Script driver: periodically samples the playback cursor and sends the
// active keyframe whenever it changes.

use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use super::Shared;
use crate::action::{MotionScript, PlaybackCursor};
use crate::config::{DRIVER_PERIOD, TICK};

/// Sampling period: fast enough to see every keyframe of `script`
pub(super) fn period_for(script: &MotionScript) -> Duration {
    let span = u32::try_from(script.min_span()).unwrap_or(u32::MAX);
    TICK.saturating_mul(span).clamp(TICK, DRIVER_PERIOD)
}

pub(super) async fn drive(
    session: Weak<Shared>,
    generation: u64,
    cursor: PlaybackCursor,
    period: Duration,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_index = None;

    loop {
        tick.tick().await;

        // Session dropped
        let Some(session) = session.upgrade() else {
            break;
        };

        let index = cursor.active_index(Instant::now());
        if last_index == Some(index) {
            continue;
        }

        let keyframe = cursor.script().keyframes()[index];
        if !session.send_if_current(generation, keyframe.command()) {
            break;
        }
        debug!(
            "Script '{}' keyframe {}: direction={}, speed={}",
            cursor.script().name(),
            index,
            keyframe.direction,
            keyframe.speed
        );
        last_index = Some(index);
    }

    debug!("Driver for '{}' stopped", cursor.script().name());
}
