//! Resource names and port discovery.
//!
//! Operators usually know the instrument by its VISA resource name
//! (`ASRL3::INSTR`, `ASRLCOM3::INSTR`, `ASRL/dev/ttyUSB0::INSTR`). The link
//! itself only needs the OS serial device path, so the name is resolved here.

use crate::error::{ItcError, ItcResult};
use serde::Serialize;

/// Resolve a resource name to an OS serial device path.
///
/// Accepted forms:
/// - `ASRL<n>::INSTR` → `COM<n>` on Windows, `/dev/ttyS<n-1>` elsewhere
/// - `ASRL<name>::INSTR` → `<name>` (`ASRLCOM3::INSTR`, `ASRL/dev/ttyUSB0::INSTR`)
/// - anything without the `ASRL` prefix is taken as a device path as-is
pub fn resolve_port(resource: &str) -> ItcResult<String> {
    let resource = resource.trim();
    if resource.is_empty() {
        return Err(ItcError::Configuration("empty resource name".into()));
    }

    let upper = resource.to_ascii_uppercase();
    if !upper.starts_with("ASRL") {
        return Ok(resource.to_string());
    }

    let body = &resource[4..];
    let body = match body.rfind("::") {
        Some(idx) if body[idx + 2..].eq_ignore_ascii_case("INSTR") => &body[..idx],
        Some(_) => {
            return Err(ItcError::Configuration(format!(
                "unsupported resource class in '{resource}'"
            )))
        }
        None => body,
    };

    if body.is_empty() {
        return Err(ItcError::Configuration(format!(
            "no port in resource '{resource}'"
        )));
    }

    match body.parse::<u32>() {
        Ok(number) => Ok(numbered_port(number)),
        Err(_) => Ok(body.to_string()),
    }
}

#[cfg(windows)]
fn numbered_port(number: u32) -> String {
    format!("COM{number}")
}

#[cfg(not(windows))]
fn numbered_port(number: u32) -> String {
    format!("/dev/ttyS{}", number.saturating_sub(1))
}

/// A serial port visible to the operating system.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// OS device path
    pub port_name: String,
    /// Equivalent VISA resource name
    pub resource: String,
    /// Short description of the port type
    pub kind: String,
}

/// Enumerate serial ports, sorted by name.
#[cfg(feature = "instrument_serial")]
pub fn list_resources() -> ItcResult<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|err| ItcError::Io(std::io::Error::other(err.to_string())))?;

    let mut infos: Vec<PortInfo> = ports
        .into_iter()
        .map(|port| {
            let kind = match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => format!(
                    "usb {:04x}:{:04x}{}",
                    usb.vid,
                    usb.pid,
                    usb.product.map(|p| format!(" {p}")).unwrap_or_default()
                ),
                serialport::SerialPortType::PciPort => "pci".to_string(),
                serialport::SerialPortType::BluetoothPort => "bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "unknown".to_string(),
            };
            PortInfo {
                resource: format!("ASRL{}::INSTR", port.port_name),
                port_name: port.port_name,
                kind,
            }
        })
        .collect();
    infos.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(infos)
}

/// Enumerate serial ports, sorted by name.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_resources() -> ItcResult<Vec<PortInfo>> {
    Err(ItcError::SerialFeatureDisabled)
}
