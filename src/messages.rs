// Message types exchanged with remote controllers

use serde::{Deserialize, Serialize};

// Command from a remote controller -> runtime
// Tagged by "op", e.g. {"op": "manual", "direction": true, "speed": 40}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionCommand {
    Manual { direction: bool, speed: u8 },
    Scripted { name: String },
    Stop,
    ReloadActions,
    Open { port: String },
    Close,
}

/// What the session is currently driving
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Idle,
    Manual {
        direction: bool,
        speed: u8,
    },
    Scripted {
        name: String,
    },
}

/// Status published by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub port: Option<String>,
    #[serde(flatten)]
    pub mode: SessionMode,
}

/// A serial port the device may be attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub friendly_name: String,
    pub port_name: String,
}
