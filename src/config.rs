//! Configuration loading using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults (the instrument's factory channel layout)
//! 2. a TOML file (`config/mercury_itc.toml` unless another path is given)
//! 3. environment variables prefixed with `MERCURY_ITC_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use mercury_itc::config::ItcConfig;
//!
//! let config = ItcConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), mercury_itc::error::ItcError>(())
//! ```
//!
//! Environment example: `MERCURY_ITC_LINK__RESOURCE=ASRL3::INSTR`.

use crate::error::{ItcError, ItcResult};
use crate::registry::{
    default_channels, default_pairs, ChannelDefinition, ChannelRegistry, PairDefinition,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/mercury_itc.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "MERCURY_ITC_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItcConfig {
    /// Channel subject to the automatic hand-off
    pub gas_flow_channel: Option<String>,
    /// Application settings
    pub application: ApplicationConfig,
    /// Physical link settings
    pub link: LinkConfig,
    /// Worker timing
    pub scheduler: SchedulerConfig,
    /// Write coordinator settings
    pub writer: WriterConfig,
    /// Channel table
    pub channels: Vec<ChannelDefinition>,
    /// Temperature/heater pairing table
    pub pairs: Vec<PairDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// VISA-style resource name or OS device path
    #[serde(default)]
    pub resource: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-response read timeout
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Pause after the initial open before the first transaction
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
}

/// Periodic worker timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poll scheduler tick period
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Heater metering tick period
    #[serde(with = "humantime_serde", default = "default_metering_interval")]
    pub metering_interval: Duration,
    /// Pause between consecutive heater reads in the metering loop
    #[serde(with = "humantime_serde", default = "default_metering_recycle_delay")]
    pub metering_recycle_delay: Duration,
    /// Ticks the gas-flow channel stays Primary after promotion
    #[serde(default = "default_handoff_ticks")]
    pub handoff_ticks: u32,
}

/// Write coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Attempts per write (and per calibration/loop-setting read)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_metering_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_metering_recycle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_handoff_ticks() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Mercury ITC".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            resource: None,
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            settle: default_settle(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            metering_interval: default_metering_interval(),
            metering_recycle_delay: default_metering_recycle_delay(),
            handoff_ticks: default_handoff_ticks(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ItcConfig {
    fn default() -> Self {
        Self {
            gas_flow_channel: Some("DB4".to_string()),
            application: ApplicationConfig::default(),
            link: LinkConfig::default(),
            scheduler: SchedulerConfig::default(),
            writer: WriterConfig::default(),
            channels: default_channels(),
            pairs: default_pairs(),
        }
    }
}

impl ItcConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> ItcResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ItcResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Layered provider stack, exposed for callers that merge extra sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ItcConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ItcResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ItcError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ItcError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.writer.max_attempts == 0 {
            return Err(ItcError::Configuration(
                "writer.max_attempts must be at least 1".into(),
            ));
        }
        if self.scheduler.handoff_ticks == 0 {
            return Err(ItcError::Configuration(
                "scheduler.handoff_ticks must be at least 1".into(),
            ));
        }
        if self.scheduler.poll_interval.is_zero() || self.scheduler.metering_interval.is_zero() {
            return Err(ItcError::Configuration(
                "worker intervals must be non-zero".into(),
            ));
        }

        // Channel, pairing and gas-flow rules live with the registry.
        self.registry().map(|_| ())
    }

    /// Build a fresh channel registry from this configuration.
    pub fn registry(&self) -> ItcResult<ChannelRegistry> {
        ChannelRegistry::new(
            &self.channels,
            &self.pairs,
            self.gas_flow_channel.as_deref(),
        )
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> ItcResult<String> {
        toml::to_string_pretty(self)
            .map_err(|err| ItcError::Configuration(format!("cannot render configuration: {err}")))
    }
}
