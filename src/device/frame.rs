// Vorze serial command framing
//
// Every command is exactly 3 bytes: [0x01, 0x01, value]
// value bit 7 = direction, bits 0-6 = speed (0-100)

/// Command header bytes
const HEADER: [u8; 2] = [0x01, 0x01];

/// Direction flag in the value byte
const DIRECTION_BIT: u8 = 0x80;

/// Highest speed the device accepts
pub const MAX_SPEED: u8 = 100;

/// Length of one wire command
pub const FRAME_LEN: usize = 3;

/// Encode a direction + speed pair into a wire command
///
/// Speed is clamped to [`MAX_SPEED`]. A speed that would collide with the
/// direction bit is coerced to 0.
pub fn frame(direction: bool, speed: u8) -> [u8; FRAME_LEN] {
    let mut speed = speed.min(MAX_SPEED);
    if speed >= DIRECTION_BIT {
        speed = 0;
    }

    let dir = if direction { DIRECTION_BIT } else { 0x00 };
    [HEADER[0], HEADER[1], dir | speed]
}

/// The command that brings the actuator to rest
pub fn stop() -> [u8; FRAME_LEN] {
    frame(false, 0)
}
