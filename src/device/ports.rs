// Serial port discovery
//
// Lists candidate ports as {friendly name, port name} pairs. Only the port
// name is needed to open a channel.

use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::messages::PortInfo;

/// Enumerate serial ports visible to the OS
pub fn list_ports() -> Result<Vec<PortInfo>, serialport::Error> {
    let ports = serialport::available_ports()?;
    debug!("Found {} serial ports", ports.len());
    Ok(ports.iter().map(describe).collect())
}

/// Friendly name for a port: USB product or manufacturer when known
fn describe(info: &SerialPortInfo) -> PortInfo {
    let friendly_name = match &info.port_type {
        SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .or_else(|| usb.manufacturer.clone())
            .map(|name| format!("{} ({})", name, info.port_name))
            .unwrap_or_else(|| format!("USB serial ({:04x}:{:04x})", usb.vid, usb.pid)),
        SerialPortType::BluetoothPort => format!("Bluetooth ({})", info.port_name),
        SerialPortType::PciPort | SerialPortType::Unknown => info.port_name.clone(),
    };

    PortInfo {
        friendly_name,
        port_name: info.port_name.clone(),
    }
}
