//! Serial transport layer
//!
//! Provides the byte transport the protocol engine writes through, plus
//! port enumeration and the serial connection configuration.
//!
//! The engine is the single writer; reads are performed by the driver's
//! reader loop on a cloned port handle. Writes are fire-and-forget.

use grblkit_core::{ConnectionError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Serial connection configuration (8-N-1 at 115200 by default)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1-2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Hardware flow control
    pub flow_control: bool,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            timeout_ms: 50,
        }
    }
}

impl ConnectionParams {
    /// Create parameters for a port at the default 115200 baud
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// Byte transport the protocol engine writes through
///
/// Implementations must not block the caller beyond the port's own write
/// buffering; the engine treats every write as fire-and-forget.
pub trait Transport: Send {
    /// Write raw bytes to the device
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// The port name this transport is bound to
    fn port_name(&self) -> &str;

    /// Close the transport
    fn close(&mut self) -> Result<()>;
}

/// Information about an available serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

/// List available serial ports on the system
///
/// Returns available ports filtered to CNC controller patterns:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => {
            let port_infos: Vec<SerialPortInfo> = ports
                .iter()
                .filter(|port| is_valid_cnc_port(&port.port_name))
                .map(|port| {
                    let mut info = SerialPortInfo {
                        port_name: port.port_name.clone(),
                        description: port_description(port),
                        manufacturer: None,
                        serial_number: None,
                        vid: None,
                        pid: None,
                    };

                    if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
                        info.vid = Some(usb_info.vid);
                        info.pid = Some(usb_info.pid);
                        info.manufacturer = usb_info.manufacturer.clone();
                        info.serial_number = usb_info.serial_number.clone();
                    }

                    info
                })
                .collect();

            Ok(port_infos)
        }
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(ConnectionError::IoError {
                reason: format!("Failed to enumerate ports: {}", e),
            }
            .into())
        }
    }
}

/// Check if a port name matches CNC controller patterns
fn is_valid_cnc_port(port_name: &str) -> bool {
    // Windows COM ports
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Linux USB and ACM devices
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }

    // macOS serial and modem devices
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }

    false
}

/// Get a user-friendly description for a port
fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

/// Real serial transport backed by the `serialport` crate
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    port_name: String,
}

impl SerialTransport {
    /// Open a serial port with the given parameters
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        let builder = serialport::new(&params.port, params.baud_rate)
            .timeout(Duration::from_millis(params.timeout_ms))
            .data_bits(match params.data_bits {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                _ => serialport::DataBits::Eight,
            })
            .stop_bits(match params.stop_bits {
                2 => serialport::StopBits::Two,
                _ => serialport::StopBits::One,
            })
            .parity(to_serialport_parity(params.parity))
            .flow_control(if params.flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            });

        match builder.open() {
            Ok(port) => Ok(Self {
                port,
                port_name: params.port.clone(),
            }),
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                Err(ConnectionError::FailedToOpen {
                    port: params.port.clone(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Clone the underlying port handle for a dedicated reader loop
    pub fn clone_reader(&self) -> Result<Box<dyn serialport::SerialPort>> {
        self.port.try_clone().map_err(|e| {
            ConnectionError::IoError {
                reason: format!("Failed to clone port handle: {}", e),
            }
            .into()
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(|e| {
            ConnectionError::WriteFailed {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle releases the port; nothing more to do here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = ConnectionParams::default();
        assert_eq!(params.baud_rate, 115200);
        assert_eq!(params.data_bits, 8);
        assert_eq!(params.stop_bits, 1);
        assert_eq!(params.parity, SerialParity::None);
    }

    #[test]
    fn test_cnc_port_patterns() {
        assert!(is_valid_cnc_port("COM3"));
        assert!(is_valid_cnc_port("/dev/ttyUSB0"));
        assert!(is_valid_cnc_port("/dev/ttyACM1"));
        assert!(is_valid_cnc_port("/dev/cu.usbserial-1420"));
        assert!(!is_valid_cnc_port("/dev/ttyS0"));
        assert!(!is_valid_cnc_port("COMX"));
    }
}
