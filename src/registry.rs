//! Channel registry: the static channel table plus its runtime state.
//!
//! One `ChannelRegistry` is built at startup from configuration and shared
//! (behind an `Arc`) by the scheduler, the metering loop, the control panel
//! fetch and the write coordinator. All tier mutation goes through a handful of
//! methods that take the write lock once, so a pair hand-over is never
//! observable half-done.
//!
//! Invariant: among the temperature/heater pairs, exactly one pair is Primary
//! (sensor and heater together); all others are Secondary.

use crate::error::{ItcError, ItcResult};
use crate::measurement::Value;
use crate::protocol::MeasurementKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Refresh-rate class of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Sampled every tick
    Primary,
    /// Sampled on the secondary sub-cycle
    Secondary,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Primary => f.write_str("primary"),
            Tier::Secondary => f.write_str("secondary"),
        }
    }
}

/// Static description of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    /// Logical id (front-panel slot, e.g. `MB1`)
    pub id: String,
    /// Display name (e.g. `VTI_Hx_MB1.T`)
    pub name: String,
    /// Physical address (e.g. `DEV:MB1.T1:TEMP`)
    pub address: String,
    /// Signal read by the poll scheduler
    pub measurement: MeasurementKind,
    /// Initial tier
    pub tier: Tier,
}

/// Temperature sensor and the heater driven by its loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairDefinition {
    /// Temperature channel id
    pub sensor: String,
    /// Heater channel id
    pub heater: String,
}

/// Runtime view of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Logical id
    pub id: String,
    /// Display name
    pub name: String,
    /// Physical address
    pub address: String,
    /// Current tier
    pub tier: Tier,
    /// Signal kind
    pub measurement: MeasurementKind,
    /// Last successfully decoded reading
    pub last_known: Option<Value>,
}

impl Channel {
    /// Heater channels carry a derived power ratio.
    pub fn is_heater(&self) -> bool {
        self.measurement.is_heater()
    }
}

/// Heater parameters needed for the power ratio; created on first read.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterCalibration {
    /// Heater channel id
    pub channel_id: String,
    /// Voltage limit (`VLIM`)
    pub max_voltage: Option<f64>,
    /// Heater resistance (`RES`)
    pub resistance: Option<f64>,
}

#[derive(Debug)]
struct RegistryState {
    channels: Vec<Channel>,
    calibrations: HashMap<String, HeaterCalibration>,
}

impl RegistryState {
    fn get_mut(&mut self, id: &str) -> ItcResult<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ItcError::UnknownChannel(id.to_string()))
    }

    fn get(&self, id: &str) -> ItcResult<&Channel> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ItcError::UnknownChannel(id.to_string()))
    }
}

/// Explicitly owned channel table shared by all workers.
#[derive(Debug)]
pub struct ChannelRegistry {
    state: RwLock<RegistryState>,
    pairs: Vec<PairDefinition>,
    gas_flow: Option<String>,
}

impl ChannelRegistry {
    /// Build and validate a registry.
    pub fn new(
        channels: &[ChannelDefinition],
        pairs: &[PairDefinition],
        gas_flow: Option<&str>,
    ) -> ItcResult<Self> {
        let mut seen = HashSet::new();
        for channel in channels {
            if !seen.insert(channel.id.as_str()) {
                return Err(ItcError::Configuration(format!(
                    "duplicate channel id '{}'",
                    channel.id
                )));
            }
        }

        let kind_of = |id: &str| {
            channels
                .iter()
                .find(|c| c.id == id)
                .map(|c| (c.measurement, c.tier))
                .ok_or_else(|| {
                    ItcError::Configuration(format!("pair references unknown channel '{id}'"))
                })
        };

        let mut primary_pairs = 0;
        for pair in pairs {
            let (sensor_kind, sensor_tier) = kind_of(&pair.sensor)?;
            let (heater_kind, heater_tier) = kind_of(&pair.heater)?;
            if sensor_kind != MeasurementKind::Temp || heater_kind != MeasurementKind::Volt {
                return Err(ItcError::Configuration(format!(
                    "pair {}/{} must join a TEMP sensor with a VOLT heater",
                    pair.sensor, pair.heater
                )));
            }
            if sensor_tier != heater_tier {
                return Err(ItcError::Configuration(format!(
                    "pair {}/{} has mismatched tiers",
                    pair.sensor, pair.heater
                )));
            }
            if sensor_tier == Tier::Primary {
                primary_pairs += 1;
            }
        }
        if !pairs.is_empty() && primary_pairs != 1 {
            return Err(ItcError::Configuration(format!(
                "exactly one temperature/heater pair must be primary, found {primary_pairs}"
            )));
        }

        if let Some(gas) = gas_flow {
            let (kind, _) = kind_of(gas).map_err(|_| {
                ItcError::Configuration(format!("unknown gas-flow channel '{gas}'"))
            })?;
            if kind != MeasurementKind::Perc {
                return Err(ItcError::Configuration(format!(
                    "gas-flow channel '{gas}' must be a PERC channel"
                )));
            }
        }

        let channels = channels
            .iter()
            .map(|def| Channel {
                id: def.id.clone(),
                name: def.name.clone(),
                address: def.address.clone(),
                tier: def.tier,
                measurement: def.measurement,
                last_known: None,
            })
            .collect();

        Ok(Self {
            state: RwLock::new(RegistryState {
                channels,
                calibrations: HashMap::new(),
            }),
            pairs: pairs.to_vec(),
            gas_flow: gas_flow.map(str::to_string),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every channel in registry order.
    pub fn snapshot(&self) -> Vec<Channel> {
        self.read().channels.clone()
    }

    /// Channel ids in registry order.
    pub fn ids(&self) -> Vec<String> {
        self.read().channels.iter().map(|c| c.id.clone()).collect()
    }

    /// Copy of one channel.
    pub fn channel(&self, id: &str) -> ItcResult<Channel> {
        self.read().get(id).cloned()
    }

    /// Physical address of a channel.
    pub fn address(&self, id: &str) -> ItcResult<String> {
        self.read().get(id).map(|c| c.address.clone())
    }

    /// Current tier of a channel.
    pub fn tier(&self, id: &str) -> ItcResult<Tier> {
        self.read().get(id).map(|c| c.tier)
    }

    /// Heater channels in registry order.
    pub fn heaters(&self) -> Vec<Channel> {
        self.read()
            .channels
            .iter()
            .filter(|c| c.is_heater())
            .cloned()
            .collect()
    }

    /// Pairing table.
    pub fn pairs(&self) -> &[PairDefinition] {
        &self.pairs
    }

    /// Heater paired with a temperature sensor.
    pub fn paired_heater(&self, sensor: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.sensor == sensor)
            .map(|p| p.heater.as_str())
    }

    /// The currently primary temperature sensor of the pairing table.
    pub fn primary_sensor(&self) -> Option<Channel> {
        let state = self.read();
        self.pairs
            .iter()
            .filter_map(|p| state.get(&p.sensor).ok())
            .find(|c| c.tier == Tier::Primary)
            .cloned()
    }

    /// Make `sensor` and its heater Primary and every other pair Secondary,
    /// in one step.
    pub fn select_primary(&self, sensor: &str) -> ItcResult<()> {
        if !self.pairs.iter().any(|p| p.sensor == sensor) {
            return Err(ItcError::UnknownChannel(sensor.to_string()));
        }

        let mut state = self.write();
        for pair in &self.pairs {
            let tier = if pair.sensor == sensor {
                Tier::Primary
            } else {
                Tier::Secondary
            };
            state.get_mut(&pair.sensor)?.tier = tier;
            state.get_mut(&pair.heater)?.tier = tier;
        }
        drop(state);

        tracing::info!(sensor, "primary temperature sensor selected");
        Ok(())
    }

    /// Id of the gas-flow channel, if one is configured.
    pub fn gas_flow_id(&self) -> Option<&str> {
        self.gas_flow.as_deref()
    }

    /// Whether the gas-flow channel is currently Primary.
    pub fn gas_flow_is_primary(&self) -> bool {
        match &self.gas_flow {
            Some(id) => matches!(self.tier(id), Ok(Tier::Primary)),
            None => false,
        }
    }

    /// Set the tier of the gas-flow channel. Returns whether it changed.
    pub fn set_gas_flow_tier(&self, tier: Tier) -> bool {
        let Some(id) = self.gas_flow.as_deref() else {
            return false;
        };
        let mut state = self.write();
        match state.get_mut(id) {
            Ok(channel) if channel.tier != tier => {
                channel.tier = tier;
                tracing::info!(channel = id, %tier, "gas-flow tier changed");
                true
            }
            _ => false,
        }
    }

    /// Store a successfully decoded reading.
    pub fn record_reading(&self, id: &str, value: Value) -> ItcResult<()> {
        self.write().get_mut(id)?.last_known = Some(value);
        Ok(())
    }

    /// Last successfully decoded reading of a channel.
    pub fn last_known(&self, id: &str) -> Option<Value> {
        self.read().get(id).ok().and_then(|c| c.last_known.clone())
    }

    /// Calibration of a heater, if any part of it has been read.
    pub fn calibration(&self, id: &str) -> Option<HeaterCalibration> {
        self.read().calibrations.get(id).cloned()
    }

    /// Store a heater voltage limit, creating the calibration on first use.
    pub fn record_max_voltage(&self, id: &str, max_voltage: f64) -> ItcResult<()> {
        self.update_calibration(id, |cal| cal.max_voltage = Some(max_voltage))
    }

    /// Store a heater resistance, creating the calibration on first use.
    pub fn record_resistance(&self, id: &str, resistance: f64) -> ItcResult<()> {
        self.update_calibration(id, |cal| cal.resistance = Some(resistance))
    }

    fn update_calibration(
        &self,
        id: &str,
        update: impl FnOnce(&mut HeaterCalibration),
    ) -> ItcResult<()> {
        let mut state = self.write();
        if !state.get(id)?.is_heater() {
            return Err(ItcError::Configuration(format!("'{id}' is not a heater channel")));
        }
        let calibration = state
            .calibrations
            .entry(id.to_string())
            .or_insert_with(|| HeaterCalibration {
                channel_id: id.to_string(),
                max_voltage: None,
                resistance: None,
            });
        update(calibration);
        Ok(())
    }
}

/// Factory channel layout of the instrument.
pub fn default_channels() -> Vec<ChannelDefinition> {
    let def = |id: &str, name: &str, address: &str, measurement, tier| ChannelDefinition {
        id: id.to_string(),
        name: name.to_string(),
        address: address.to_string(),
        measurement,
        tier,
    };
    vec![
        def("MB1", "VTI_Hx_MB1.T", "DEV:MB1.T1:TEMP", MeasurementKind::Temp, Tier::Primary),
        def("DB6", "VTI_SR_DB6.T", "DEV:DB6.T1:TEMP", MeasurementKind::Temp, Tier::Secondary),
        def("DB4", "DB4.G1.%", "DEV:DB4.G1:AUX", MeasurementKind::Perc, Tier::Secondary),
        def("MB0", "Hx_htr_MB0.V", "DEV:MB0.H1:HTR", MeasurementKind::Volt, Tier::Primary),
        def("DB1", "SR_htr_DB1.V", "DEV:DB1.H1:HTR", MeasurementKind::Volt, Tier::Secondary),
    ]
}

/// Factory temperature/heater pairing.
pub fn default_pairs() -> Vec<PairDefinition> {
    vec![
        PairDefinition {
            sensor: "MB1".into(),
            heater: "MB0".into(),
        },
        PairDefinition {
            sensor: "DB6".into(),
            heater: "DB1".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Reading, Unit};

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(&default_channels(), &default_pairs(), Some("DB4")).unwrap()
    }

    #[test]
    fn factory_layout_is_valid() {
        let reg = registry();
        assert_eq!(reg.ids(), vec!["MB1", "DB6", "DB4", "MB0", "DB1"]);
        assert_eq!(reg.primary_sensor().map(|c| c.id), Some("MB1".to_string()));
        assert_eq!(reg.paired_heater("DB6"), Some("DB1"));
        assert!(!reg.gas_flow_is_primary());
    }

    #[test]
    fn select_primary_swaps_whole_pairs() {
        let reg = registry();
        reg.select_primary("DB6").unwrap();

        assert_eq!(reg.tier("DB6").unwrap(), Tier::Primary);
        assert_eq!(reg.tier("DB1").unwrap(), Tier::Primary);
        assert_eq!(reg.tier("MB1").unwrap(), Tier::Secondary);
        assert_eq!(reg.tier("MB0").unwrap(), Tier::Secondary);
        // gas flow is not part of any pair
        assert_eq!(reg.tier("DB4").unwrap(), Tier::Secondary);
    }

    #[test]
    fn select_primary_rejects_unpaired_channels() {
        let reg = registry();
        assert!(matches!(reg.select_primary("DB4"), Err(ItcError::UnknownChannel(_))));
        assert!(matches!(reg.select_primary("MB0"), Err(ItcError::UnknownChannel(_))));
        assert_eq!(reg.tier("MB1").unwrap(), Tier::Primary);
    }

    #[test]
    fn rejects_two_primary_pairs() {
        let mut channels = default_channels();
        for c in channels.iter_mut() {
            if c.id == "DB6" || c.id == "DB1" {
                c.tier = Tier::Primary;
            }
        }
        let err = ChannelRegistry::new(&channels, &default_pairs(), None).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_gas_channel() {
        let mut channels = default_channels();
        channels.push(channels[0].clone());
        assert!(ChannelRegistry::new(&channels, &default_pairs(), None).is_err());

        assert!(ChannelRegistry::new(&default_channels(), &default_pairs(), Some("MB1")).is_err());
        assert!(ChannelRegistry::new(&default_channels(), &default_pairs(), Some("ZZ")).is_err());
    }

    #[test]
    fn gas_flow_tier_changes_are_reported_once() {
        let reg = registry();
        assert!(reg.set_gas_flow_tier(Tier::Primary));
        assert!(!reg.set_gas_flow_tier(Tier::Primary));
        assert!(reg.gas_flow_is_primary());
        assert!(reg.set_gas_flow_tier(Tier::Secondary));
    }

    #[test]
    fn calibration_is_created_lazily_for_heaters_only() {
        let reg = registry();
        assert!(reg.calibration("MB0").is_none());
        reg.record_max_voltage("MB0", 20.0).unwrap();
        let cal = reg.calibration("MB0").unwrap();
        assert_eq!(cal.max_voltage, Some(20.0));
        assert_eq!(cal.resistance, None);

        assert!(reg.record_resistance("MB1", 80.0).is_err());
    }

    #[test]
    fn last_known_value_is_kept_per_channel() {
        let reg = registry();
        let value = Value::Reading(Reading::new(23.4, Unit::Kelvin));
        reg.record_reading("MB1", value.clone()).unwrap();
        assert_eq!(reg.last_known("MB1"), Some(value));
        assert_eq!(reg.last_known("DB6"), None);
    }
}
