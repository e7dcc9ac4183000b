// Serial command channel
//
// Owns one serial connection. Ordered writes are queued on a single writer task
// so they reach the wire in submission order; detached writes are dispatched
// immediately. In both modes only one write holds the port at a time. Close and
// drop wait for detached writes before the stop command is queued, so stop is
// always the last command on the wire.
//
// State machine: Closed -> Opening -> Open -> Closing -> Closed

use serialport::{Parity, SerialPort};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::frame;
use crate::config::{BAUD_RATE, WRITE_TIMEOUT};

/// Error types for the serial channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Serial port error on {port}: {source}")]
    Port {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial channel is not open")]
    NotOpen,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Outcome of one write: bytes written or the failure
pub type WriteResult = Result<usize>;

/// Completion handler for a submitted write
pub type Completion = Box<dyn FnOnce(WriteResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// How a write is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Dispatched immediately, no ordering across callers
    Detached,
    /// Queued on the writer task, written in submission order
    Ordered,
}

/// The byte sink behind a channel
///
/// Implemented for real serial ports; tests plug in an in-memory link.
pub trait SerialLink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn baud_rate(&self) -> serialport::Result<u32>;
    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()>;
    fn parity(&self) -> serialport::Result<Parity>;
    fn set_parity(&mut self, parity: Parity) -> serialport::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut **self, bytes)?;
        io::Write::flush(&mut **self)
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        SerialPort::baud_rate(&**self)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()> {
        SerialPort::set_baud_rate(&mut **self, baud_rate)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        SerialPort::parity(&**self)
    }

    fn set_parity(&mut self, parity: Parity) -> serialport::Result<()> {
        SerialPort::set_parity(&mut **self, parity)
    }
}

/// Opens serial links by port name
pub trait PortOpener: Send + Sync {
    fn open(&self, port_name: &str) -> serialport::Result<Box<dyn SerialLink>>;
}

/// Opens OS serial ports through `serialport`
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, port_name: &str) -> serialport::Result<Box<dyn SerialLink>> {
        let port = serialport::new(port_name, BAUD_RATE)
            .parity(Parity::None)
            .timeout(WRITE_TIMEOUT)
            .open()?;

        let link: Box<dyn SerialLink> = Box::new(port);
        Ok(link)
    }
}

/// Identifies one in-flight write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteToken(u64);

/// Writes issued but not yet completed
#[derive(Debug, Default)]
struct PendingWrites {
    next: AtomicU64,
    inflight: Mutex<HashSet<WriteToken>>,
}

impl PendingWrites {
    fn register(&self) -> WriteToken {
        let token = WriteToken(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.inflight).insert(token);
        token
    }

    fn finish(&self, token: WriteToken) {
        let removed = lock(&self.inflight).remove(&token);
        assert!(removed, "write {:?} completed twice", token);
    }

    fn len(&self) -> usize {
        lock(&self.inflight).len()
    }
}

type SharedLink = Arc<Mutex<Box<dyn SerialLink>>>;

struct WriteJob {
    token: WriteToken,
    payload: Box<[u8]>,
    on_complete: Option<Completion>,
}

/// An open port, its writer task and detached writes in flight
struct Connection {
    port_name: String,
    link: SharedLink,
    queue: mpsc::UnboundedSender<WriteJob>,
    writer: JoinHandle<()>,
    detached: JoinSet<()>,
}

struct Shared {
    state: ChannelState,
    conn: Option<Connection>,
}

struct Inner {
    opener: Arc<dyn PortOpener>,
    shared: Mutex<Shared>,
    pending: Arc<PendingWrites>,
}

/// Handle to a serial command channel
///
/// Cloning yields another handle to the same channel. All methods must be
/// called from within a Tokio runtime.
#[derive(Clone)]
pub struct SerialChannel {
    inner: Arc<Inner>,
}

impl Default for SerialChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialChannel {
    /// Create a closed channel backed by OS serial ports
    pub fn new() -> Self {
        Self::with_opener(Arc::new(SystemPorts))
    }

    /// Create a closed channel using a custom port opener
    pub fn with_opener(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            inner: Arc::new(Inner {
                opener,
                shared: Mutex::new(Shared {
                    state: ChannelState::Closed,
                    conn: None,
                }),
                pending: Arc::new(PendingWrites::default()),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner.shared).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Name of the open port, if any
    pub fn port_name(&self) -> Option<String> {
        lock(&self.inner.shared)
            .conn
            .as_ref()
            .map(|conn| conn.port_name.clone())
    }

    /// Number of writes issued but not yet completed
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.len()
    }

    /// Open the port and apply the default line settings
    ///
    /// An open channel is closed first. On failure the channel stays Closed.
    pub async fn open(&self, port_name: &str) -> Result<()> {
        self.close().await;

        {
            let mut shared = lock(&self.inner.shared);
            if shared.state != ChannelState::Closed {
                return Err(ChannelError::Port {
                    port: port_name.to_string(),
                    source: serialport::Error::new(
                        serialport::ErrorKind::Unknown,
                        "channel is busy opening or closing",
                    ),
                });
            }
            shared.state = ChannelState::Opening;
        }

        info!("Opening serial port {} at {} baud", port_name, BAUD_RATE);
        let opener = self.inner.opener.clone();
        let name = port_name.to_string();
        let opened = tokio::task::spawn_blocking(move || open_configured(opener.as_ref(), &name))
            .await
            .unwrap_or_else(|e| {
                Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    e.to_string(),
                ))
            });

        let link = match opened {
            Ok(link) => link,
            Err(source) => {
                warn!("Failed to open serial port {}: {}", port_name, source);
                lock(&self.inner.shared).state = ChannelState::Closed;
                return Err(ChannelError::Port {
                    port: port_name.to_string(),
                    source,
                });
            }
        };

        let link: SharedLink = Arc::new(Mutex::new(link));
        let (queue, jobs) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(link.clone(), jobs, self.inner.pending.clone()));

        let mut shared = lock(&self.inner.shared);
        shared.conn = Some(Connection {
            port_name: port_name.to_string(),
            link,
            queue,
            writer,
            detached: JoinSet::new(),
        });
        shared.state = ChannelState::Open;
        info!("Serial port {} open", port_name);
        Ok(())
    }

    /// Command the actuator to rest, then release the port
    ///
    /// Detached writes in flight finish first, then the stop command is queued
    /// behind any ordered writes. The port is released only after it completes.
    /// No-op unless Open.
    pub async fn close(&self) {
        let mut detached = {
            let mut shared = lock(&self.inner.shared);
            if shared.state != ChannelState::Open {
                return;
            }
            shared.state = ChannelState::Closing;
            match shared.conn.as_mut() {
                Some(conn) => {
                    info!("Closing serial port {}", conn.port_name);
                    std::mem::take(&mut conn.detached)
                }
                None => JoinSet::new(),
            }
        };

        // No new detached writes start once Closing
        join_detached(&mut detached).await;

        let stop_done = {
            let shared = lock(&self.inner.shared);
            shared
                .conn
                .as_ref()
                .map(|conn| enqueue_stop(conn, &self.inner.pending))
        };

        if let Some(done) = stop_done {
            match done.await {
                Ok(Ok(_)) => debug!("Stop command written before close"),
                Ok(Err(e)) => warn!("Stop command failed while closing: {}", e),
                Err(_) => warn!("Serial writer ended before the stop command completed"),
            }
        }

        let conn = lock(&self.inner.shared).conn.take();
        if let Some(Connection {
            port_name,
            link,
            queue,
            writer,
            ..
        }) = conn
        {
            drop(queue);
            drop(link);
            if let Err(e) = writer.await {
                warn!("Serial writer for {} ended abnormally: {}", port_name, e);
            }
            info!("Serial port {} closed", port_name);
        }

        lock(&self.inner.shared).state = ChannelState::Closed;
    }

    /// Submit a write
    ///
    /// The payload is copied before this returns; the caller's buffer is never
    /// read afterwards. If the channel is not Open, `on_complete` runs before
    /// this returns with [`ChannelError::NotOpen`]. Write failures are reported
    /// to `on_complete` only and never close the channel.
    pub fn send(&self, payload: &[u8], mode: SendMode, on_complete: Option<Completion>) {
        let mut shared = lock(&self.inner.shared);
        let state = shared.state;
        let conn = match shared.conn.as_mut() {
            Some(conn) if state == ChannelState::Open => conn,
            _ => {
                drop(shared);
                debug!("Rejecting {} byte write, channel not open", payload.len());
                complete(on_complete, Err(ChannelError::NotOpen));
                return;
            }
        };

        let owned: Box<[u8]> = Box::from(payload);
        assert!(
            payload.is_empty() || !std::ptr::eq(owned.as_ptr(), payload.as_ptr()),
            "serial write buffer aliases caller memory"
        );
        let token = self.inner.pending.register();

        match mode {
            SendMode::Ordered => {
                let job = WriteJob {
                    token,
                    payload: owned,
                    on_complete,
                };
                if let Err(mpsc::error::SendError(job)) = conn.queue.send(job) {
                    drop(shared);
                    self.inner.pending.finish(job.token);
                    complete(job.on_complete, Err(ChannelError::NotOpen));
                }
            }
            SendMode::Detached => {
                // Reap finished writes so the set stays small
                while conn.detached.try_join_next().is_some() {}
                let link = conn.link.clone();
                let pending = self.inner.pending.clone();
                conn.detached.spawn(async move {
                    let result = write_blocking(link, owned).await;
                    finish_write(&pending, token, result, on_complete);
                });
            }
        }
    }

    /// Ordered write that resolves when the bytes are on the wire
    pub async fn write(&self, payload: &[u8]) -> WriteResult {
        let (tx, rx) = oneshot::channel();
        self.send(
            payload,
            SendMode::Ordered,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.await.unwrap_or(Err(ChannelError::NotOpen))
    }

    pub fn baud_rate(&self) -> Result<u32> {
        self.with_link(|port, link| link.baud_rate().map_err(|source| port_error(port, source)))
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.with_link(|port, link| {
            info!("Setting {} baud rate to {}", port, baud_rate);
            link.set_baud_rate(baud_rate)
                .map_err(|source| port_error(port, source))
        })
    }

    pub fn parity(&self) -> Result<Parity> {
        self.with_link(|port, link| link.parity().map_err(|source| port_error(port, source)))
    }

    pub fn set_parity(&self, parity: Parity) -> Result<()> {
        self.with_link(|port, link| {
            info!("Setting {} parity to {:?}", port, parity);
            link.set_parity(parity)
                .map_err(|source| port_error(port, source))
        })
    }

    /// Run `f` against the open link, waiting for any write in progress
    fn with_link<T>(&self, f: impl FnOnce(&str, &mut dyn SerialLink) -> Result<T>) -> Result<T> {
        let (port_name, link) = {
            let shared = lock(&self.inner.shared);
            match shared.conn.as_ref() {
                Some(conn) if shared.state == ChannelState::Open => {
                    (conn.port_name.clone(), conn.link.clone())
                }
                _ => return Err(ChannelError::NotOpen),
            }
        };

        let mut link = lock(&link);
        f(&port_name, &mut **link)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(conn) = shared.conn.take() else {
            return;
        };
        let Connection {
            port_name,
            link,
            queue,
            mut detached,
            ..
        } = conn;

        // Stop the actuator when the channel is dropped (safety measure). The
        // stop goes behind detached and queued writes; the writer releases the
        // port once it has drained.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pending = self.pending.clone();
            runtime.spawn(async move {
                join_detached(&mut detached).await;
                let (job, done) = stop_job(&pending);
                if let Err(mpsc::error::SendError(job)) = queue.send(job) {
                    pending.finish(job.token);
                    warn!("Serial writer for {} gone, actuator not stopped on drop", port_name);
                    return;
                }
                drop(queue);
                match done.await {
                    Ok(Ok(_)) => debug!("Stop command written on drop of {}", port_name),
                    Ok(Err(e)) => warn!("Failed to stop actuator on drop of {}: {}", port_name, e),
                    Err(_) => warn!("Serial writer for {} ended before the stop command", port_name),
                }
            });
            return;
        }

        // Outside a runtime nothing drains the queue; write directly
        drop(detached);
        drop(queue);
        let mut link = lock(&link);
        match link.write_all(&frame::stop()) {
            Ok(()) => debug!("Stop command written on drop of {}", port_name),
            Err(e) => warn!("Failed to stop actuator on drop of {}: {}", port_name, e),
        }
    }
}

fn open_configured(opener: &dyn PortOpener, port_name: &str) -> serialport::Result<Box<dyn SerialLink>> {
    let mut link = opener.open(port_name)?;
    link.set_baud_rate(BAUD_RATE)?;
    link.set_parity(Parity::None)?;
    Ok(link)
}

/// A stop command job and the receiver for its outcome
fn stop_job(pending: &PendingWrites) -> (WriteJob, oneshot::Receiver<WriteResult>) {
    let (tx, rx) = oneshot::channel();
    let job = WriteJob {
        token: pending.register(),
        payload: Box::new(frame::stop()),
        on_complete: Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    };
    (job, rx)
}

fn enqueue_stop(conn: &Connection, pending: &PendingWrites) -> oneshot::Receiver<WriteResult> {
    let (job, rx) = stop_job(pending);
    if let Err(mpsc::error::SendError(job)) = conn.queue.send(job) {
        // Dropping the job drops `tx`, the receiver sees the writer is gone
        pending.finish(job.token);
    }
    rx
}

/// Drain ordered writes one at a time
async fn write_loop(
    link: SharedLink,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    pending: Arc<PendingWrites>,
) {
    while let Some(job) = jobs.recv().await {
        let result = write_blocking(link.clone(), job.payload).await;
        finish_write(&pending, job.token, result, job.on_complete);
    }
    debug!("Serial writer stopped");
}

/// Wait for every detached write in `tasks`
async fn join_detached(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Detached serial write ended abnormally: {}", e);
        }
    }
}

async fn write_blocking(link: SharedLink, payload: Box<[u8]>) -> WriteResult {
    tokio::task::spawn_blocking(move || -> WriteResult {
        let mut link = lock(&link);
        link.write_all(&payload)?;
        Ok(payload.len())
    })
    .await
    .unwrap_or_else(|e| Err(ChannelError::Io(io::Error::other(e))))
}

fn finish_write(
    pending: &PendingWrites,
    token: WriteToken,
    result: WriteResult,
    on_complete: Option<Completion>,
) {
    match &result {
        Ok(n) => debug!("Serial write {:?} done ({} bytes)", token, n),
        Err(e) => warn!("Serial write {:?} failed: {}", token, e),
    }
    pending.finish(token);
    complete(on_complete, result);
}

fn complete(on_complete: Option<Completion>, result: WriteResult) {
    if let Some(on_complete) = on_complete {
        on_complete(result);
    }
}

fn port_error(port: &str, source: serialport::Error) -> ChannelError {
    ChannelError::Port {
        port: port.to_string(),
        source,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
