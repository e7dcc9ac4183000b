// Serial device module for the Vorze actuator
//
// Provides:
// - 3-byte wire command framing
// - Serial command channel with ordered writes and in-flight tracking
// - Serial port discovery

mod channel;
pub mod frame;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{
    ChannelError, ChannelState, Completion, PortOpener, SendMode, SerialChannel, SerialLink,
    SystemPorts, WriteResult, WriteToken,
};
pub use frame::frame;
pub use ports::list_ports;
