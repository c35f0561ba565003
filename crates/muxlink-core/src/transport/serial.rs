//! Serial port discovery and opening
//!
//! The device enumerates as a USB CDC-ACM function, so discovery prefers
//! `ttyACM` ports over generic `ttyUSB` adapters, and opening asserts DTR
//! and RTS: boards with an auto-reset circuit reboot when DTR drops, which
//! would tear down the session mid-handshake.

use std::cmp::Ordering;
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::{debug, warn};

use super::DEFAULT_BAUD_RATE;
use crate::ProtocolError;

/// A serial port candidate for a device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS path, e.g. `/dev/ttyACM0` or `COM3`
    pub name: String,
    /// USB `(vendor, product)` id pair when the port is a USB function
    pub usb_id: Option<(u16, u16)>,
    /// Product string from the USB descriptor, when reported
    pub product: Option<String>,
}

/// Ordering class for a port name: CDC-ACM devices first (in numeric order),
/// then USB-serial adapters, then everything else.
fn rank(name: &str) -> (u8, u32) {
    let base = name.rsplit('/').next().unwrap_or(name);
    for (prefix, class) in [("ttyACM", 0u8), ("ttyUSB", 1)] {
        if let Some(index) = base.strip_prefix(prefix) {
            return (class, index.parse().unwrap_or(u32::MAX));
        }
    }
    (2, 0)
}

fn port_order(a: &PortInfo, b: &PortInfo) -> Ordering {
    rank(&a.name)
        .cmp(&rank(&b.name))
        .then_with(|| a.name.cmp(&b.name))
}

/// Enumerate serial ports, most likely device candidates first.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| {
            let (usb_id, product) = match info.port_type {
                SerialPortType::UsbPort(usb) => (Some((usb.vid, usb.pid)), usb.product),
                _ => (None, None),
            };
            PortInfo {
                name: info.port_name,
                usb_id,
                product,
            }
        })
        .collect();

    // CDC-ACM gadget ports sometimes escape the enumeration API on Linux;
    // sweep /dev for the usual names and add any it missed.
    #[cfg(target_os = "linux")]
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let file = entry.file_name();
            if let Some(base) = file.to_str() {
                if !base.starts_with("ttyACM") && !base.starts_with("ttyUSB") {
                    continue;
                }
                let name = format!("/dev/{}", base);
                if !ports.iter().any(|port| port.name == name) {
                    ports.push(PortInfo {
                        name,
                        usb_id: None,
                        product: None,
                    });
                }
            }
        }
    }

    ports.sort_by(port_order);
    ports
}

/// Open a port configured for the device link: 8N1, no flow control, DTR
/// and RTS held high.
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let mut port = serialport::new(name, baud)
        // Short timeout keeps the polling read loop responsive
        .timeout(Duration::from_millis(100))
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;

    // Line state failures are not fatal: not every adapter implements them
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("could not assert DTR on {}: {}", name, e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        warn!("could not assert RTS on {}: {}", name, e);
    }

    debug!(port = name, baud, "serial port open");
    Ok(port)
}
