//! Typed values decoded at the protocol boundary.
//!
//! The instrument reports readings as unit-suffixed text (`"23.4K"`, `"9.98V"`,
//! `"45.0%"`). They are decoded once into a [`Reading`] carrying the numeric
//! magnitude and a [`Unit`] tag, so nothing downstream has to strip suffixes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical unit attached to a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// Kelvin (temperature sensors)
    Kelvin,
    /// Volt (heater output)
    Volt,
    /// Ampere
    Ampere,
    /// Ohm (heater resistance, sensor resistance)
    Ohm,
    /// Watt
    Watt,
    /// Percent (gas-flow valve opening, heater percentage)
    Percent,
    /// Seconds
    Second,
    /// Bare number without a suffix
    Dimensionless,
}

impl Unit {
    /// Suffix the instrument appends for this unit.
    pub fn suffix(self) -> &'static str {
        match self {
            Unit::Kelvin => "K",
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Ohm => "O",
            Unit::Watt => "W",
            Unit::Percent => "%",
            Unit::Second => "s",
            Unit::Dimensionless => "",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "K" => Some(Unit::Kelvin),
            "V" => Some(Unit::Volt),
            "A" => Some(Unit::Ampere),
            "O" | "Ohm" | "Ω" => Some(Unit::Ohm),
            "W" => Some(Unit::Watt),
            "%" => Some(Unit::Percent),
            "s" => Some(Unit::Second),
            "" => Some(Unit::Dimensionless),
            _ => None,
        }
    }
}

/// A numeric reading with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Numeric magnitude
    pub magnitude: f64,
    /// Unit tag
    pub unit: Unit,
}

impl Reading {
    /// Create a reading.
    pub fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    /// Parse unit-suffixed instrument text such as `"23.4K"` or `"1.0E-1V"`.
    ///
    /// Returns `None` when the text is not a number followed by a known suffix.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let split = text
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(idx, c)| idx + c.len_utf8())?;
        let (number, suffix) = text.split_at(split);
        let unit = Unit::from_suffix(suffix.trim())?;
        let magnitude = number.parse::<f64>().ok()?;
        if !magnitude.is_finite() {
            return None;
        }
        Some(Self { magnitude, unit })
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit.suffix())
    }
}

/// A decoded response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Numeric reading with a unit
    Reading(Reading),
    /// Anything else (`ON`/`OFF`, catalog entries, identification strings)
    Text(String),
}

impl Value {
    /// Decode a response field, preferring a typed reading.
    pub fn decode(field: &str) -> Self {
        match Reading::parse(field) {
            Some(reading) => Value::Reading(reading),
            None => Value::Text(field.to_string()),
        }
    }

    /// The reading, if this value is numeric.
    pub fn as_reading(&self) -> Option<Reading> {
        match self {
            Value::Reading(reading) => Some(*reading),
            Value::Text(_) => None,
        }
    }

    /// Numeric magnitude regardless of unit.
    pub fn magnitude(&self) -> Option<f64> {
        self.as_reading().map(|r| r.magnitude)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reading(reading) => fmt::Display::fmt(reading, f),
            Value::Text(text) => f.write_str(text),
        }
    }
}
