// Command loop: remote commands in over zenoh, session status out
//
// Commands arrive as JSON on <prefix>/cmd and are applied to the active
// session; status is published on <prefix>/state/session every loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

use crate::action::{ActionLibrary, LibraryError};
use crate::config::{LOOP_HZ, RuntimeConfig};
use crate::messages::{SessionCommand, SessionMode, SessionStatus};
use crate::session::{DeviceSession, SessionError, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No serial port is open")]
    NotConnected,

    #[error("No action file configured")]
    NoActionFile,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Library(#[from] LibraryError),
}

pub struct Runtime {
    sessions: SessionManager,
    actions_path: Option<PathBuf>,
    // Port name and session commands are applied to
    current: Option<(String, DeviceSession)>,
}

impl Runtime {
    pub fn new(sessions: SessionManager, actions_path: Option<PathBuf>) -> Self {
        Self {
            sessions,
            actions_path,
            current: None,
        }
    }

    fn library(&self) -> &Arc<ActionLibrary> {
        self.sessions.library()
    }

    /// Load the action file, if one is configured
    pub fn load_actions(&self) -> Result<usize, CommandError> {
        let path = self.actions_path.as_deref().ok_or(CommandError::NoActionFile)?;
        let count = self.library().reload_from_file(path)?;
        info!("Loaded {} actions from {}", count, path.display());
        Ok(count)
    }

    /// Switch the active session to `port`, closing the previous one
    pub async fn open(&mut self, port: &str) -> Result<(), CommandError> {
        if let Some((previous, _)) = self.current.take() {
            self.sessions.remove(&previous).await;
        }
        let session = self.sessions.create(port).await?;
        self.current = Some((port.to_string(), session));
        Ok(())
    }

    pub async fn close(&mut self) {
        self.current = None;
        self.sessions.stop_all().await;
    }

    /// Process an incoming command
    pub async fn on_command(&mut self, cmd: SessionCommand) -> Result<(), CommandError> {
        info!("Received command: {:?}", &cmd);
        match cmd {
            SessionCommand::Manual { direction, speed } => {
                self.session()?.set_manual(direction, speed)?
            }
            SessionCommand::Scripted { name } => self.session()?.set_scripted(&name)?,
            SessionCommand::Stop => self.session()?.stop()?,
            SessionCommand::ReloadActions => {
                self.load_actions()?;
            }
            SessionCommand::Open { port } => self.open(&port).await?,
            SessionCommand::Close => self.close().await,
        }
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        match &self.current {
            Some((_, session)) => session.status(),
            None => SessionStatus {
                connected: false,
                port: None,
                mode: SessionMode::Idle,
            },
        }
    }

    fn session(&self) -> Result<&DeviceSession, CommandError> {
        self.current
            .as_ref()
            .map(|(_, session)| session)
            .ok_or(CommandError::NotConnected)
    }
}

pub async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let library = Arc::new(ActionLibrary::new());
    let mut runtime = Runtime::new(SessionManager::new(library), config.actions.clone());

    match runtime.load_actions() {
        Ok(_) | Err(CommandError::NoActionFile) => {}
        Err(e) => warn!("Failed to load actions: {}", e),
    }

    if let Some(port) = &config.port {
        if let Err(e) = runtime.open(port).await {
            warn!("Failed to open {}: {} (waiting for an open command)", port, e);
        }
    }

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let cmd_topic = config.command_topic();
    let state_topic = config.state_topic();
    let subscriber = session.declare_subscriber(cmd_topic.as_str()).await?;
    let pub_state = session.declare_publisher(state_topic.as_str()).await?;

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Runtime started: {}Hz loop", LOOP_HZ);
    info!("Subscribed to: {}", cmd_topic);
    info!("Publishing to: {}", state_topic);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down, stopping device");
                break;
            }
            _ = tick.tick() => {}
        }

        // 1. Drain all pending commands (non-blocking), in arrival order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<SessionCommand>(&payload) {
                Ok(cmd) => {
                    if let Err(e) = runtime.on_command(cmd).await {
                        warn!("Command failed: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        // 2. Publish status
        let status_json = serde_json::to_string(&runtime.status())?;
        pub_state.put(status_json).await?;
    }

    runtime.close().await;
    Ok(())
}
