//! Heater power ratio.
//!
//! `ratio = 100 * (voltage / max_voltage)^2`, in percent of full heater power.
//! When either input is missing or unusable the previous ratio of that heater
//! is returned unchanged instead of an error or zero.

use crate::measurement::{Reading, Unit};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Pure power-ratio formula. `None` when `max_voltage` cannot be divided by.
pub fn power_ratio(voltage: f64, max_voltage: f64) -> Option<f64> {
    if !voltage.is_finite() || !max_voltage.is_finite() || max_voltage <= 0.0 {
        return None;
    }
    Some(100.0 * (voltage / max_voltage).powi(2))
}

/// Power-ratio calculator with a last-good value per heater.
///
/// Shared between the poll scheduler and the metering worker.
#[derive(Debug, Default)]
pub struct PowerRatioCalculator {
    last_good: Mutex<HashMap<String, f64>>,
}

impl PowerRatioCalculator {
    /// Create an empty calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the ratio for `channel_id`, or fall back to its last good value.
    ///
    /// `voltage` must be a volt reading; anything else counts as a failed read.
    /// Returns `None` only while no ratio has ever been computed for the heater.
    pub fn update(
        &self,
        channel_id: &str,
        voltage: Option<Reading>,
        max_voltage: Option<f64>,
    ) -> Option<f64> {
        let mut last_good = self
            .last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let fresh = match (voltage, max_voltage) {
            (Some(reading), Some(max)) if reading.unit == Unit::Volt => {
                power_ratio(reading.magnitude, max)
            }
            _ => None,
        };

        match fresh {
            Some(ratio) => {
                last_good.insert(channel_id.to_string(), ratio);
                Some(ratio)
            }
            None => {
                let previous = last_good.get(channel_id).copied();
                tracing::debug!(channel = channel_id, ?previous, "power ratio unavailable, keeping last value");
                previous
            }
        }
    }

    /// Last good ratio of a heater.
    pub fn last(&self, channel_id: &str) -> Option<f64> {
        self.last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volts(v: f64) -> Option<Reading> {
        Some(Reading::new(v, Unit::Volt))
    }

    #[test]
    fn half_voltage_is_quarter_power() {
        assert_eq!(power_ratio(10.0, 20.0), Some(25.0));
        assert_eq!(power_ratio(20.0, 20.0), Some(100.0));
        assert_eq!(power_ratio(0.0, 20.0), Some(0.0));
    }

    #[test]
    fn zero_limit_is_not_divided_by() {
        assert_eq!(power_ratio(10.0, 0.0), None);
        assert_eq!(power_ratio(f64::NAN, 20.0), None);
    }

    #[test]
    fn failed_read_keeps_last_good_ratio() {
        let calc = PowerRatioCalculator::new();
        assert_eq!(calc.update("MB0", volts(10.0), Some(20.0)), Some(25.0));
        assert_eq!(calc.update("MB0", None, Some(20.0)), Some(25.0));
        assert_eq!(calc.update("MB0", volts(10.0), None), Some(25.0));
        assert_eq!(calc.last("MB0"), Some(25.0));
    }

    #[test]
    fn wrong_unit_counts_as_failure() {
        let calc = PowerRatioCalculator::new();
        calc.update("MB0", volts(10.0), Some(20.0));
        let kelvin = Some(Reading::new(4.2, Unit::Kelvin));
        assert_eq!(calc.update("MB0", kelvin, Some(20.0)), Some(25.0));
    }

    #[test]
    fn heaters_are_tracked_independently() {
        let calc = PowerRatioCalculator::new();
        calc.update("MB0", volts(10.0), Some(20.0));
        assert_eq!(calc.update("DB1", None, Some(20.0)), None);
        assert_eq!(calc.update("DB1", volts(20.0), Some(20.0)), Some(100.0));
        assert_eq!(calc.last("MB0"), Some(25.0));
    }
}
