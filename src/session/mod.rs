// Device session: arbitrates between manual commands and script playback
//
// One session owns one serial channel. At any time either nothing, a manual
// command or a single script driver is feeding it, never two at once.

mod driver;
mod manager;

pub use manager::SessionManager;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::{ActionLibrary, PlaybackCursor};
use crate::device::frame::{self, FRAME_LEN, MAX_SPEED};
use crate::device::{ChannelError, Completion, SendMode, SerialChannel};
use crate::messages::{SessionMode, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown action mode '{0}'")]
    UnknownMode(String),

    #[error("A session for port {0} already exists")]
    PortInUse(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

enum Mode {
    Idle,
    Manual { direction: bool, speed: u8 },
    Scripted(PlaybackCursor),
}

struct State {
    mode: Mode,
    // Bumped whenever the command source changes; a driver only sends while
    // its generation is current.
    generation: u64,
    driver: Option<JoinHandle<()>>,
}

struct Shared {
    channel: SerialChannel,
    library: Arc<ActionLibrary>,
    state: Mutex<State>,
}

/// Handle to a device session; clones share the session
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("port", &self.port_name())
            .field("mode", &self.current_mode())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(channel: SerialChannel, library: Arc<ActionLibrary>) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                library,
                state: Mutex::new(State {
                    mode: Mode::Idle,
                    generation: 0,
                    driver: None,
                }),
            }),
        }
    }

    pub fn channel(&self) -> &SerialChannel {
        &self.shared.channel
    }

    pub async fn open(&self, port_name: &str) -> Result<(), SessionError> {
        self.shared.channel.open(port_name).await?;
        Ok(())
    }

    /// Cancel any script, rest the actuator and release the port
    pub async fn close(&self) {
        {
            let mut state = self.shared.lock_state();
            state.cancel_driver();
            state.mode = Mode::Idle;
        }
        self.shared.channel.close().await;
    }

    pub fn is_open(&self) -> bool {
        self.shared.channel.is_open()
    }

    pub fn port_name(&self) -> Option<String> {
        self.shared.channel.port_name()
    }

    pub fn current_mode(&self) -> SessionMode {
        match &self.shared.lock_state().mode {
            Mode::Idle => SessionMode::Idle,
            Mode::Manual { direction, speed } => SessionMode::Manual {
                direction: *direction,
                speed: *speed,
            },
            Mode::Scripted(cursor) => SessionMode::Scripted {
                name: cursor.script().name().to_string(),
            },
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.is_open(),
            port: self.port_name(),
            mode: self.current_mode(),
        }
    }

    /// Drive the actuator directly, cancelling any running script
    ///
    /// On a closed channel the session keeps its previous mode.
    pub fn set_manual(&self, direction: bool, speed: u8) -> Result<(), SessionError> {
        let speed = speed.min(MAX_SPEED);
        if !self.shared.channel.is_open() {
            return Err(ChannelError::NotOpen.into());
        }

        let mut state = self.shared.lock_state();
        state.cancel_driver();
        state.mode = Mode::Manual { direction, speed };
        info!("Manual mode: direction={}, speed={}", direction, speed);
        self.shared.send(frame::frame(direction, speed));
        Ok(())
    }

    /// Start looping the named action from now
    ///
    /// On failure the session keeps its previous mode.
    pub fn set_scripted(&self, name: &str) -> Result<(), SessionError> {
        let script = self
            .shared
            .library
            .lookup(name)
            .ok_or_else(|| SessionError::UnknownMode(name.to_string()))?;
        if !self.shared.channel.is_open() {
            return Err(ChannelError::NotOpen.into());
        }

        let mut state = self.shared.lock_state();
        state.cancel_driver();

        let period = driver::period_for(&script);
        let cursor = PlaybackCursor::start(script);
        info!(
            "Scripted mode: '{}' (cycle {} ticks, driver every {:?})",
            name,
            cursor.script().cycle_length(),
            period
        );
        state.driver = Some(tokio::spawn(driver::drive(
            Arc::downgrade(&self.shared),
            state.generation,
            cursor.clone(),
            period,
        )));
        state.mode = Mode::Scripted(cursor);
        Ok(())
    }

    /// Bring the actuator to rest
    pub fn stop(&self) -> Result<(), SessionError> {
        self.set_manual(false, 0)
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ordered send; failures are logged
    fn send(&self, command: [u8; FRAME_LEN]) {
        let on_complete: Completion = Box::new(move |result| {
            if let Err(e) = result {
                warn!("Command {:02X?} failed: {}", command, e);
            }
        });
        self.channel.send(&command, SendMode::Ordered, Some(on_complete));
    }

    /// Send on behalf of a driver, unless it has been superseded
    fn send_if_current(&self, generation: u64, command: [u8; FRAME_LEN]) -> bool {
        let state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        self.send(command);
        true
    }
}

impl State {
    fn cancel_driver(&mut self) {
        self.generation += 1;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Keyframe, MotionScript};
    use crate::device::testing::{MockOpener, MockWire};
    use std::time::Duration;

    fn library() -> Arc<ActionLibrary> {
        Arc::new(ActionLibrary::with_scripts([
            MotionScript::new(
                "swing",
                vec![Keyframe::new(true, 50, 30), Keyframe::new(false, 20, 60)],
            )
            .unwrap(),
            MotionScript::new("steady", vec![Keyframe::new(true, 70, 1000)]).unwrap(),
        ]))
    }

    async fn open_session(wire: &MockWire) -> DeviceSession {
        let channel = SerialChannel::with_opener(Arc::new(MockOpener::new(wire.clone())));
        let session = DeviceSession::new(channel, library());
        session.open("/dev/ttyMOCK0").await.unwrap();
        session
    }

    async fn settle(session: &DeviceSession) {
        for _ in 0..500 {
            if session.channel().pending_writes() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("writes still pending");
    }

    #[tokio::test]
    async fn test_manual_command_is_clamped() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;

        session.set_manual(true, 150).unwrap();
        settle(&session).await;

        assert_eq!(wire.commands(), vec![[0x01, 0x01, 0x80 | 100]]);
        assert_eq!(
            session.current_mode(),
            SessionMode::Manual {
                direction: true,
                speed: 100
            }
        );
    }

    #[tokio::test]
    async fn test_manual_on_closed_channel_fails() {
        let channel = SerialChannel::with_opener(Arc::new(MockOpener::new(MockWire::default())));
        let session = DeviceSession::new(channel, library());

        let err = session.set_manual(true, 10).unwrap_err();
        assert!(matches!(err, SessionError::Channel(ChannelError::NotOpen)));
        let status = session.status();
        assert!(!status.connected);
        assert_eq!(status.mode, SessionMode::Idle);
    }

    #[tokio::test]
    async fn test_manual_after_close_keeps_idle() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;
        session.close().await;

        assert!(session.set_manual(true, 40).is_err());
        assert!(session.stop().is_err());
        assert_eq!(session.current_mode(), SessionMode::Idle);
        assert_eq!(wire.commands(), vec![frame::stop()]);
    }

    #[tokio::test]
    async fn test_debug_shows_port_and_mode() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;
        session.set_manual(true, 25).unwrap();

        let debug = format!("{:?}", session);
        assert!(debug.contains("/dev/ttyMOCK0"), "{}", debug);
        assert!(debug.contains("Manual"), "{}", debug);
    }

    #[tokio::test]
    async fn test_unknown_mode_keeps_previous_mode() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;
        session.set_manual(false, 30).unwrap();

        let err = session.set_scripted("missing").unwrap_err();
        assert!(matches!(err, SessionError::UnknownMode(ref name) if name == "missing"));
        assert_eq!(
            session.current_mode(),
            SessionMode::Manual {
                direction: false,
                speed: 30
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_script_drives_keyframes_in_order() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;

        session.set_scripted("swing").unwrap();
        assert_eq!(
            session.current_mode(),
            SessionMode::Scripted {
                name: "swing".to_string()
            }
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        session.stop().unwrap();
        settle(&session).await;

        let commands = wire.commands();
        let forward = frame::frame(true, 50);
        let back = frame::frame(false, 20);
        assert_eq!(commands.first(), Some(&forward));
        assert_eq!(commands.last(), Some(&frame::stop()));
        // Consecutive script commands alternate between the two keyframes
        let script_part = &commands[..commands.len() - 1];
        assert!(script_part.len() >= 3, "too few script commands: {:?}", script_part);
        for pair in script_part.windows(2) {
            assert_ne!(pair[0], pair[1]);
            assert!(pair.iter().all(|c| *c == forward || *c == back));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_cancels_script_driver() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;

        session.set_scripted("swing").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.set_manual(true, 5).unwrap();
        settle(&session).await;
        let after_manual = wire.commands().len();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let commands = wire.commands();
        assert_eq!(commands.len(), after_manual);
        assert_eq!(commands.last(), Some(&frame::frame(true, 5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_switching_scripts_replaces_driver() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;

        session.set_scripted("swing").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.set_scripted("steady").unwrap();
        settle(&session).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let commands = wire.commands();
        let steady = frame::frame(true, 70);
        let first_steady = commands.iter().position(|c| *c == steady).unwrap();
        assert!(commands[first_steady..].iter().all(|c| *c == steady));
        assert_eq!(
            session.current_mode(),
            SessionMode::Scripted {
                name: "steady".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_close_rests_actuator() {
        let wire = MockWire::default();
        let session = open_session(&wire).await;

        session.set_scripted("steady").unwrap();
        session.close().await;

        assert_eq!(session.current_mode(), SessionMode::Idle);
        assert!(!session.is_open());
        assert_eq!(wire.commands().last(), Some(&frame::stop()));
        assert!(wire.released());
    }
}
