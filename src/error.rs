//! Custom error types for the controller.
//!
//! This module defines the primary error type, `ItcError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the kinds of failure that occur between the configuration files, the
//! serial link and the instrument firmware.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parse failures from figment and semantic
//!   validation failures of an otherwise well-formed configuration.
//! - **`Io`**, **`LinkNotOpen`**, **`Timeout`**, **`LinkClosed`**: link-level
//!   failures. These never escape the worker loops; they are treated as transient.
//! - **`InvalidResponse`** / **`Malformed`**: the instrument answered, but with the
//!   `INVALID` sentinel or with something the decoder could not make sense of.
//! - **`UnknownChannel`**, **`OutOfRange`**, **`NotConnected`**: request-level
//!   rejections reported before any I/O takes place.
//!
//! `ItcError::is_transient` is the single place that decides whether a caller
//! should retry (or fall back to its last known value) or give up.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ItcResult<T> = std::result::Result<T, ItcError>;

#[derive(Error, Debug)]
pub enum ItcError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link is not open")]
    LinkNotOpen,

    #[error("Link closed while reading response")]
    LinkClosed,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Failed to open link '{resource}': {reason}")]
    Open { resource: String, reason: String },

    #[error("Instrument rejected request '{0}'")]
    InvalidResponse(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("ITC not connected")]
    NotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for ItcError {
    fn from(value: figment::Error) -> Self {
        ItcError::Config(Box::new(value))
    }
}

impl ItcError {
    /// Whether the failure is worth retrying on the next attempt or tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ItcError::Io(_)
                | ItcError::LinkNotOpen
                | ItcError::LinkClosed
                | ItcError::Timeout(_)
                | ItcError::Open { .. }
                | ItcError::InvalidResponse(_)
                | ItcError::Malformed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_and_protocol_failures_are_transient() {
        assert!(ItcError::LinkNotOpen.is_transient());
        assert!(ItcError::Timeout(Duration::from_secs(2)).is_transient());
        assert!(ItcError::InvalidResponse("READ:DEV:MB1.T1:TEMP:SIG:TEMP".into()).is_transient());
        assert!(ItcError::Malformed("".into()).is_transient());
    }

    #[test]
    fn request_rejections_are_permanent() {
        assert!(!ItcError::NotConnected.is_transient());
        assert!(!ItcError::UnknownChannel("XX9".into()).is_transient());
        assert!(!ItcError::OutOfRange("set point must be 0-2000".into()).is_transient());
        assert!(!ItcError::Configuration("duplicate channel".into()).is_transient());
    }

    #[test]
    fn out_of_range_displays_message_verbatim() {
        let err = ItcError::OutOfRange("set point must be 0-2000".into());
        assert_eq!(err.to_string(), "set point must be 0-2000");
    }
}
