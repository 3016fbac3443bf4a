//! Command/response protocol of the temperature controller.
//!
//! Protocol Overview:
//! - Format: ASCII, colon-separated paths (SCPI-like, but NOT a generic SCPI tree)
//! - Write terminator: LF + CR (`"\n\r"`)
//! - Read request: `READ:<address>:<command>` → `STAT:<address>:<command>:<value>`
//! - Set request: `SET:<address>:<command>:<value>` → `STAT:SET:...:VALID` or `...:INVALID`
//! - Device catalog: `READ:SYS:CAT`
//! - Identification: bare `*IDN?`
//!
//! Only the last `:` field of a response carries the value. The literal
//! `INVALID` there is a transient rejection (busy firmware, stale transaction),
//! never a value to display.
//!
//! This module is a pure translator: no caching, no tiering, no retries.

use crate::error::{ItcError, ItcResult};
use crate::hardware::link::Link;
use crate::measurement::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminator appended to every request.
pub const WRITE_TERMINATOR: &str = "\n\r";

/// Sentinel for a rejected request.
pub const INVALID: &str = "INVALID";

/// Sentinel for an accepted set request.
pub const VALID: &str = "VALID";

/// Device catalog path.
pub const CATALOG: &str = "SYS:CAT";

/// Identification query.
pub const IDENTIFY: &str = "*IDN?";

/// Measurement a channel produces on its `SIG` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeasurementKind {
    /// Temperature sensor (`SIG:TEMP`)
    Temp,
    /// Heater output voltage (`SIG:VOLT`)
    Volt,
    /// Auxiliary percentage, e.g. gas-flow valve (`SIG:PERC`)
    Perc,
}

impl MeasurementKind {
    /// Wire name of the signal.
    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::Temp => "TEMP",
            MeasurementKind::Volt => "VOLT",
            MeasurementKind::Perc => "PERC",
        }
    }

    /// Heater channels are voltage-derived and carry a power ratio.
    pub fn is_heater(self) -> bool {
        matches!(self, MeasurementKind::Volt)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command nodes below a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Live signal of the given kind
    Signal(MeasurementKind),
    /// Heater voltage limit
    VoltageLimit,
    /// Heater resistance
    Resistance,
    /// Loop proportional gain
    LoopP,
    /// Loop integral gain
    LoopI,
    /// Loop derivative gain
    LoopD,
    /// Manual heater percentage
    HeaterPercent,
    /// Manual gas-flow percentage
    FlowPercent,
    /// Temperature set point
    SetPoint,
    /// Automatic gas-flow control
    FlowAuto,
    /// Set-point sweep mode
    SweepMode,
    /// PID control enable
    PidEnable,
    /// Sweep table file
    SweepTable,
    /// Calibration hot limit
    HotLimit,
}

impl Command {
    /// Wire path of the command node.
    pub fn path(self) -> String {
        let path = match self {
            Command::Signal(kind) => return format!("SIG:{}", kind.as_str()),
            Command::VoltageLimit => "VLIM",
            Command::Resistance => "RES",
            Command::LoopP => "LOOP:P",
            Command::LoopI => "LOOP:I",
            Command::LoopD => "LOOP:D",
            Command::HeaterPercent => "LOOP:HSET",
            Command::FlowPercent => "LOOP:FSET",
            Command::SetPoint => "LOOP:TSET",
            Command::FlowAuto => "LOOP:FAUT",
            Command::SweepMode => "LOOP:SWMD",
            Command::PidEnable => "LOOP:ENAB",
            Command::SweepTable => "LOOP:SWFL",
            Command::HotLimit => "CAL:HOTL",
        };
        path.to_string()
    }
}

/// Result of a read request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Decoded value
    Value(Value),
    /// The instrument answered `INVALID`
    Invalid,
}

/// Result of a set request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Decoded response was exactly `VALID`
    Valid,
    /// Anything else, `INVALID` included
    Invalid,
}

/// Build a read request (without terminator).
pub fn encode_read(address: &str, command: &str) -> String {
    format!("READ:{address}:{command}")
}

/// Build a set request (without terminator).
pub fn encode_set(address: &str, command: &str, value: &str) -> String {
    format!("SET:{address}:{command}:{value}")
}

/// Append the line terminator.
pub fn frame(request: &str) -> Vec<u8> {
    format!("{request}{WRITE_TERMINATOR}").into_bytes()
}

/// Strip trailing terminator bytes from a raw response.
pub fn decode_line(raw: &[u8]) -> ItcResult<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n', '\0']).trim_start_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ItcError::Malformed("empty response".into()));
    }
    Ok(line.to_string())
}

/// Last `:`-separated field of a response line.
pub fn last_field(line: &str) -> ItcResult<&str> {
    let field = line.rsplit(':').next().unwrap_or_default().trim();
    if field.is_empty() {
        return Err(ItcError::Malformed(format!("no value in '{line}'")));
    }
    Ok(field)
}

/// Split a `SYS:CAT` response into `DEV:<uid>:<type>` addresses.
pub fn parse_catalog(line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split(':').collect();
    let mut devices = Vec::new();
    let mut idx = 0;
    while idx < tokens.len() {
        if tokens[idx] == "DEV" && idx + 2 < tokens.len() {
            devices.push(format!("DEV:{}:{}", tokens[idx + 1], tokens[idx + 2]));
            idx += 3;
        } else {
            idx += 1;
        }
    }
    devices
}

/// Write a request and return the trimmed response line.
pub async fn query(link: &mut dyn Link, request: &str) -> ItcResult<String> {
    tracing::debug!(request, "sending");
    link.write(&frame(request)).await?;
    let raw = link.read_raw().await?;
    let line = decode_line(&raw)?;
    tracing::debug!(request, response = %line, "received");
    Ok(line)
}

/// `READ:<address>:<command>`.
pub async fn read(link: &mut dyn Link, address: &str, command: &str) -> ItcResult<Reply> {
    let line = query(link, &encode_read(address, command)).await?;
    let field = last_field(&line)?;
    if field == INVALID {
        return Ok(Reply::Invalid);
    }
    Ok(Reply::Value(Value::decode(field)))
}

/// `SET:<address>:<command>:<value>`.
pub async fn set(
    link: &mut dyn Link,
    address: &str,
    command: &str,
    value: &str,
) -> ItcResult<SetOutcome> {
    let line = query(link, &encode_set(address, command, value)).await?;
    match last_field(&line) {
        Ok(VALID) => Ok(SetOutcome::Valid),
        Ok(_) | Err(_) => Ok(SetOutcome::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Reading, Unit};

    #[test]
    fn encodes_requests() {
        assert_eq!(
            encode_read("DEV:MB1.T1:TEMP", &Command::Signal(MeasurementKind::Temp).path()),
            "READ:DEV:MB1.T1:TEMP:SIG:TEMP"
        );
        assert_eq!(
            encode_set("DEV:MB1.T1:TEMP", &Command::SetPoint.path(), "80"),
            "SET:DEV:MB1.T1:TEMP:LOOP:TSET:80"
        );
        assert_eq!(frame("*IDN?"), b"*IDN?\n\r".to_vec());
    }

    #[test]
    fn decodes_last_field_without_terminator() {
        let line = decode_line(b"STAT:DEV:MB1.T1:TEMP:SIG:TEMP:23.4K\n").unwrap();
        assert_eq!(last_field(&line).unwrap(), "23.4K");

        let line = decode_line(b"STAT:SET:DEV:MB0.H1:HTR:VLIM:20:VALID\r\n").unwrap();
        assert_eq!(last_field(&line).unwrap(), "VALID");
    }

    #[test]
    fn rejects_empty_responses() {
        assert!(matches!(decode_line(b"\n"), Err(ItcError::Malformed(_))));
        assert!(matches!(last_field("STAT:DEV:MB1.T1:TEMP:SIG:TEMP:"), Err(ItcError::Malformed(_))));
    }

    #[test]
    fn catalog_lists_device_addresses() {
        let devices = parse_catalog(
            "STAT:SYS:CAT:DEV:MB1.T1:TEMP:DEV:MB0.H1:HTR:DEV:DB4.G1:AUX",
        );
        assert_eq!(
            devices,
            vec!["DEV:MB1.T1:TEMP", "DEV:MB0.H1:HTR", "DEV:DB4.G1:AUX"]
        );
    }

    #[test]
    fn command_paths() {
        assert_eq!(Command::Signal(MeasurementKind::Perc).path(), "SIG:PERC");
        assert_eq!(Command::VoltageLimit.path(), "VLIM");
        assert_eq!(Command::PidEnable.path(), "LOOP:ENAB");
        assert_eq!(Command::HotLimit.path(), "CAL:HOTL");
    }

    #[tokio::test]
    async fn read_maps_invalid_sentinel() {
        use crate::hardware::mock::MockLink;

        let mut link = MockLink::new(|request| {
            if request.ends_with("SIG:TEMP") {
                Some("STAT:DEV:MB1.T1:TEMP:SIG:TEMP:INVALID".to_string())
            } else {
                Some("STAT:DEV:MB0.H1:HTR:SIG:VOLT:9.98V".to_string())
            }
        });
        link.open().await.unwrap();

        let reply = read(&mut link, "DEV:MB1.T1:TEMP", "SIG:TEMP").await.unwrap();
        assert_eq!(reply, Reply::Invalid);

        let reply = read(&mut link, "DEV:MB0.H1:HTR", "SIG:VOLT").await.unwrap();
        assert_eq!(reply, Reply::Value(Value::Reading(Reading::new(9.98, Unit::Volt))));
    }

    #[tokio::test]
    async fn set_requires_literal_valid() {
        use crate::hardware::mock::MockLink;

        let mut link = MockLink::new(|request| {
            Some(if request.ends_with(":1") {
                "STAT:SET:DEV:MB1.T1:TEMP:LOOP:P:1:VALID".to_string()
            } else {
                "STAT:SET:DEV:MB1.T1:TEMP:LOOP:P:2:NOT_FOUND".to_string()
            })
        });
        link.open().await.unwrap();

        let ok = set(&mut link, "DEV:MB1.T1:TEMP", "LOOP:P", "1").await.unwrap();
        assert_eq!(ok, SetOutcome::Valid);
        let rejected = set(&mut link, "DEV:MB1.T1:TEMP", "LOOP:P", "2").await.unwrap();
        assert_eq!(rejected, SetOutcome::Invalid);
    }
}
