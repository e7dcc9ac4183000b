// In-memory serial link for tests

use serialport::Parity;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::channel::{PortOpener, SerialLink};

/// Shared view of everything written to mock links
#[derive(Clone, Default)]
pub(crate) struct MockWire {
    bytes: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    write_delay: Duration,
}

impl MockWire {
    pub(crate) fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    /// Written bytes split into 3-byte commands
    pub(crate) fn commands(&self) -> Vec<[u8; 3]> {
        self.bytes()
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_writes(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct MockLink {
    wire: MockWire,
    baud_rate: AtomicU32,
    parity: Parity,
}

impl SerialLink for MockLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let active = self.wire.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.wire.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.wire.write_delay.is_zero() {
            std::thread::sleep(self.wire.write_delay);
        }

        let result = if self.wire.fail_writes.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"))
        } else {
            self.wire.bytes.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        };

        self.wire.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.baud_rate.load(Ordering::SeqCst))
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()> {
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
        Ok(())
    }

    fn parity(&self) -> serialport::Result<Parity> {
        Ok(self.parity)
    }

    fn set_parity(&mut self, parity: Parity) -> serialport::Result<()> {
        self.parity = parity;
        Ok(())
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.wire.released.store(true, Ordering::SeqCst);
    }
}

/// Opens mock links that all write to one [`MockWire`]
pub(crate) struct MockOpener {
    wire: MockWire,
    refuse: bool,
}

impl MockOpener {
    pub(crate) fn new(wire: MockWire) -> Self {
        Self {
            wire,
            refuse: false,
        }
    }

    /// An opener for which every port is missing
    pub(crate) fn refusing() -> Self {
        Self {
            wire: MockWire::default(),
            refuse: true,
        }
    }
}

impl PortOpener for MockOpener {
    fn open(&self, port_name: &str) -> serialport::Result<Box<dyn SerialLink>> {
        if self.refuse {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("{} not present", port_name),
            ));
        }

        self.wire.opened.fetch_add(1, Ordering::SeqCst);
        let link: Box<dyn SerialLink> = Box::new(MockLink {
            wire: self.wire.clone(),
            baud_rate: AtomicU32::new(0),
            parity: Parity::Odd,
        });
        Ok(link)
    }
}
