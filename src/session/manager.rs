// Session manager: at most one session per serial port
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{DeviceSession, SessionError};
use crate::action::ActionLibrary;
use crate::device::{PortOpener, SerialChannel, SystemPorts};

pub struct SessionManager {
    library: Arc<ActionLibrary>,
    opener: Arc<dyn PortOpener>,
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl SessionManager {
    pub fn new(library: Arc<ActionLibrary>) -> Self {
        Self::with_opener(library, Arc::new(SystemPorts))
    }

    pub fn with_opener(library: Arc<ActionLibrary>, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            library,
            opener,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn library(&self) -> &Arc<ActionLibrary> {
        &self.library
    }

    /// Open a new session on `port_name`
    pub async fn create(&self, port_name: &str) -> Result<DeviceSession, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(port_name) {
            return Err(SessionError::PortInUse(port_name.to_string()));
        }

        let channel = SerialChannel::with_opener(self.opener.clone());
        let session = DeviceSession::new(channel, self.library.clone());
        session.open(port_name).await?;

        sessions.insert(port_name.to_string(), session.clone());
        info!("Session created on {}", port_name);
        Ok(session)
    }

    pub async fn get(&self, port_name: &str) -> Option<DeviceSession> {
        self.sessions.lock().await.get(port_name).cloned()
    }

    /// Sorted ports with a session
    pub async fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Close and forget the session on `port_name`
    pub async fn remove(&self, port_name: &str) -> bool {
        let session = self.sessions.lock().await.remove(port_name);
        match session {
            Some(session) => {
                session.close().await;
                info!("Session on {} removed", port_name);
                true
            }
            None => false,
        }
    }

    /// Close every session, resting each actuator
    pub async fn stop_all(&self) {
        let sessions: Vec<DeviceSession> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
