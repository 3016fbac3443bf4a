//! Write coordinator.
//!
//! `submit` never fails: every outcome, including range errors and a missing
//! connection, is reported as a [`WriteStatus`] line.
//!
//! Order of checks:
//! 1. value bounds (no I/O at all when out of range)
//! 2. connection state (`"ITC not connected"`)
//! 3. channel lookup and kind
//! 4. up to `max_attempts` `(set, recycle)` transactions; only a decoded
//!    `VALID` counts as success

use crate::client::ItcClient;
use crate::error::{ItcError, ItcResult};
use crate::messages::WriteStatus;
use crate::protocol::{Command, MeasurementKind, SetOutcome};
use crate::registry::{ChannelRegistry, Tier};
use crate::session::ConnectionState;
use std::sync::Arc;
use tokio::sync::watch;

/// Default number of attempts per write.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A write request with its value.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    /// Manual heater output, percent
    HeaterPercent(f64),
    /// Manual gas flow, percent
    FlowPercent(f64),
    /// Temperature set point, kelvin
    SetPoint(f64),
    /// Proportional gain
    P(f64),
    /// Integral gain
    I(f64),
    /// Derivative gain
    D(f64),
    /// Automatic flow control on/off
    FlowControl(bool),
    /// Set-point sweep mode on/off
    SetPointSweep(bool),
    /// PID control on/off
    PidControl(bool),
    /// Heater voltage limit, volts
    MaxVoltage(f64),
    /// Heater resistance, ohms
    Resistance(f64),
    /// Sweep table file name
    SweepTable(String),
}

impl WriteCommand {
    /// Parse a command name and value as typed on the command line.
    ///
    /// Names: `heater`, `flow`, `setpoint`, `p`, `i`, `d`, `flow-control`,
    /// `sweep`, `pid`, `max-voltage`, `resistance`, `sweep-table`.
    pub fn parse(name: &str, value: &str) -> ItcResult<Self> {
        let number = || {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| ItcError::Configuration(format!("'{value}' is not a number")))
        };
        let switch = || match value.trim().to_ascii_uppercase().as_str() {
            "ON" | "TRUE" | "1" => Ok(true),
            "OFF" | "FALSE" | "0" => Ok(false),
            _ => Err(ItcError::Configuration(format!("'{value}' is not ON or OFF"))),
        };

        match name.to_ascii_lowercase().as_str() {
            "heater" => Ok(Self::HeaterPercent(number()?)),
            "flow" => Ok(Self::FlowPercent(number()?)),
            "setpoint" | "set-point" => Ok(Self::SetPoint(number()?)),
            "p" => Ok(Self::P(number()?)),
            "i" => Ok(Self::I(number()?)),
            "d" => Ok(Self::D(number()?)),
            "flow-control" => Ok(Self::FlowControl(switch()?)),
            "sweep" => Ok(Self::SetPointSweep(switch()?)),
            "pid" => Ok(Self::PidControl(switch()?)),
            "max-voltage" => Ok(Self::MaxVoltage(number()?)),
            "resistance" => Ok(Self::Resistance(number()?)),
            "sweep-table" => Ok(Self::SweepTable(value.trim().to_string())),
            other => Err(ItcError::Configuration(format!("unknown write command '{other}'"))),
        }
    }

    /// Text used in status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::HeaterPercent(_) => "heater %",
            Self::FlowPercent(_) => "flow %",
            Self::SetPoint(_) => "set point",
            Self::P(_) => "P value",
            Self::I(_) => "I value",
            Self::D(_) => "D value",
            Self::FlowControl(true) => "flow control enabled",
            Self::FlowControl(false) => "flow control disabled",
            Self::SetPointSweep(true) => "set point control enabled",
            Self::SetPointSweep(false) => "set point control disabled",
            Self::PidControl(true) => "PID control enabled",
            Self::PidControl(false) => "PID control disabled",
            Self::MaxVoltage(_) => "max voltage",
            Self::Resistance(_) => "resistance",
            Self::SweepTable(_) => "sweep table",
        }
    }

    /// Command node written.
    pub fn command(&self) -> Command {
        match self {
            Self::HeaterPercent(_) => Command::HeaterPercent,
            Self::FlowPercent(_) => Command::FlowPercent,
            Self::SetPoint(_) => Command::SetPoint,
            Self::P(_) => Command::LoopP,
            Self::I(_) => Command::LoopI,
            Self::D(_) => Command::LoopD,
            Self::FlowControl(_) => Command::FlowAuto,
            Self::SetPointSweep(_) => Command::SweepMode,
            Self::PidControl(_) => Command::PidEnable,
            Self::MaxVoltage(_) => Command::VoltageLimit,
            Self::Resistance(_) => Command::Resistance,
            Self::SweepTable(_) => Command::SweepTable,
        }
    }

    /// Kind of channel the command node lives on.
    pub fn target(&self) -> MeasurementKind {
        match self {
            Self::MaxVoltage(_) | Self::Resistance(_) => MeasurementKind::Volt,
            _ => MeasurementKind::Temp,
        }
    }

    /// Value as sent on the wire.
    pub fn wire_value(&self) -> String {
        match self {
            Self::HeaterPercent(v)
            | Self::FlowPercent(v)
            | Self::SetPoint(v)
            | Self::P(v)
            | Self::I(v)
            | Self::D(v)
            | Self::MaxVoltage(v)
            | Self::Resistance(v) => v.to_string(),
            Self::FlowControl(on) | Self::SetPointSweep(on) | Self::PidControl(on) => {
                let switch = if *on { "ON" } else { "OFF" };
                switch.to_string()
            }
            Self::SweepTable(file) => file.clone(),
        }
    }

    /// Check the value against the fixed bounds table.
    pub fn validate(&self) -> ItcResult<()> {
        let bounded = |value: f64, low: f64, high: f64, message: &str| {
            if value.is_finite() && (low..=high).contains(&value) {
                Ok(())
            } else {
                Err(ItcError::OutOfRange(message.to_string()))
            }
        };
        let finite = |value: f64, label: &str| {
            if value.is_finite() {
                Ok(())
            } else {
                Err(ItcError::OutOfRange(format!("{label} must be a number")))
            }
        };

        match self {
            Self::HeaterPercent(v) => bounded(*v, 0.0, 100.0, "heater percentage must be 0-100"),
            Self::FlowPercent(v) => bounded(*v, 0.0, 100.0, "flow percentage must be 0-100"),
            Self::SetPoint(v) => bounded(*v, 0.0, 2000.0, "set point must be 0-2000"),
            Self::MaxVoltage(v) => bounded(*v, 0.0, 40.0, "max voltage must be 0-40"),
            Self::Resistance(v) => bounded(*v, 10.0, 2000.0, "resistance must be 10-2000"),
            Self::P(v) | Self::I(v) | Self::D(v) => finite(*v, self.label()),
            Self::SweepTable(file) if file.is_empty() || file.contains(':') => Err(
                ItcError::OutOfRange("sweep table must be a file name".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Executes writes with bounded retries.
pub struct WriteCoordinator {
    client: ItcClient,
    registry: Arc<ChannelRegistry>,
    connection: watch::Receiver<ConnectionState>,
    max_attempts: u32,
}

impl WriteCoordinator {
    /// Coordinator with the default attempt bound.
    pub fn new(
        client: ItcClient,
        registry: Arc<ChannelRegistry>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            client,
            registry,
            connection,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the attempt bound (at least one attempt is always made).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Validate, execute and report one write.
    pub async fn submit(&self, command: &WriteCommand, channel_id: &str) -> WriteStatus {
        if let Err(err) = command.validate() {
            tracing::info!(channel = channel_id, error = %err, "write rejected before I/O");
            return WriteStatus::rejected(err.to_string());
        }

        if *self.connection.borrow() != ConnectionState::Connected {
            return WriteStatus::rejected(ItcError::NotConnected.to_string());
        }

        let channel = match self.registry.channel(channel_id) {
            Ok(channel) => channel,
            Err(err) => return WriteStatus::rejected(err.to_string()),
        };
        if channel.measurement != command.target() {
            return WriteStatus::rejected(format!(
                "{} cannot be written to {} channel {}",
                command.label(),
                channel.measurement,
                channel.id
            ));
        }

        let node = command.command();
        let value = command.wire_value();
        let label = command.label();

        for attempt in 1..=self.max_attempts {
            match self.client.set(&channel.address, node, &value).await {
                Ok(SetOutcome::Valid) => {
                    tracing::info!(channel = %channel.id, command = %node.path(), %value, attempt, "write confirmed");
                    self.apply_confirmed(command, &channel.id);
                    return WriteStatus::accepted(format!("{label} write succeeded"));
                }
                Ok(SetOutcome::Invalid) => {
                    tracing::debug!(channel = %channel.id, command = %node.path(), attempt, "write not confirmed");
                }
                Err(err) => {
                    tracing::debug!(channel = %channel.id, command = %node.path(), attempt, error = %err, "write attempt failed");
                }
            }
        }

        tracing::warn!(channel = %channel.id, command = %node.path(), attempts = self.max_attempts, "write failed");
        WriteStatus::rejected(format!("{label} write failed"))
    }

    /// Mirror a confirmed write into the registry.
    fn apply_confirmed(&self, command: &WriteCommand, channel_id: &str) {
        let recorded = match command {
            WriteCommand::FlowPercent(_) => {
                self.registry.set_gas_flow_tier(Tier::Primary);
                Ok(())
            }
            WriteCommand::MaxVoltage(volts) => self.registry.record_max_voltage(channel_id, *volts),
            WriteCommand::Resistance(ohms) => self.registry.record_resistance(channel_id, *ohms),
            _ => Ok(()),
        };
        if let Err(err) = recorded {
            tracing::warn!(channel = channel_id, error = %err, "confirmed write not recorded");
        }
    }
}
