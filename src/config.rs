// Timing, serial settings, topics and the optional JSON config file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Serial line settings (fixed by the device)
pub const BAUD_RATE: u32 = 19_200;

// Serial write timeout
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

// Duration of one motion script tick
pub const TICK: Duration = Duration::from_millis(1);

// Upper bound on the script driver period
pub const DRIVER_PERIOD: Duration = Duration::from_millis(10);

// Runtime loop frequency (command drain + status publish)
pub const LOOP_HZ: u64 = 20;

// Zenoh topics, relative to the configured key prefix
pub const TOPIC_CMD: &str = "cmd"; // commands
pub const TOPIC_STATE: &str = "state/session"; // session status

pub const DEFAULT_KEY_PREFIX: &str = "vorze";

/// Errors loading the runtime config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Runtime configuration, every field optional in the file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Serial port to open at startup
    pub port: Option<String>,
    /// Action library file
    pub actions: Option<PathBuf>,
    /// Zenoh key prefix for command and status topics
    pub key_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: None,
            actions: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn command_topic(&self) -> String {
        format!("{}/{}", self.key_prefix, TOPIC_CMD)
    }

    pub fn state_topic(&self) -> String {
        format!("{}/{}", self.key_prefix, TOPIC_STATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"port": "COM3"}"#).unwrap();
        assert_eq!(config.port.as_deref(), Some("COM3"));
        assert_eq!(config.actions, None);
        assert_eq!(config.key_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_topics_use_prefix() {
        let config = RuntimeConfig {
            key_prefix: "lab/toy".to_string(),
            ..Default::default()
        };
        assert_eq!(config.command_topic(), "lab/toy/cmd");
        assert_eq!(config.state_topic(), "lab/toy/state/session");
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": "/dev/ttyUSB0", "actions": "actions.json", "key_prefix": "bench"}}"#
        )
        .unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.actions, Some(PathBuf::from("actions.json")));
        assert_eq!(config.key_prefix, "bench");
    }

    #[test]
    fn test_load_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = RuntimeConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }
}
