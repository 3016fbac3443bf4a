//! Heater metering loop.
//!
//! On start the loop reads the voltage limit and resistance of every heater
//! (bounded retries, `INVALID` retried) and stores them as the heater's
//! calibration. It then reports a power ratio for each heater every metering
//! interval, pausing between heaters so the firmware can settle.

use crate::client::ItcClient;
use crate::messages::{emit, ChannelUpdate, FeedEvent, FeedSender, FeedValue, WorkerKind};
use crate::power::PowerRatioCalculator;
use crate::protocol::{Command, MeasurementKind, Reply};
use crate::registry::{Channel, ChannelRegistry};
use crate::session::ConnectionState;
use crate::worker::WorkerControl;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Read the heater voltage and turn it into a power ratio.
///
/// The voltage limit comes from the heater calibration; if it has never been
/// read it is fetched first, in its own transaction. Returns the last good
/// ratio when either read fails.
pub(crate) async fn read_power_ratio(
    client: &ItcClient,
    registry: &ChannelRegistry,
    power: &PowerRatioCalculator,
    heater: &Channel,
) -> Option<f64> {
    let mut max_voltage = registry
        .calibration(&heater.id)
        .and_then(|cal| cal.max_voltage);

    if max_voltage.is_none() {
        if let Ok(Reply::Value(value)) = client.read(&heater.address, Command::VoltageLimit).await {
            max_voltage = value.magnitude();
            if let Some(limit) = max_voltage {
                if let Err(err) = registry.record_max_voltage(&heater.id, limit) {
                    tracing::warn!(channel = %heater.id, error = %err, "voltage limit not recorded");
                }
            }
        }
    }

    let voltage = match client
        .read(&heater.address, Command::Signal(MeasurementKind::Volt))
        .await
    {
        Ok(Reply::Value(value)) => value.as_reading(),
        Ok(Reply::Invalid) | Err(_) => None,
    };

    power.update(&heater.id, voltage, max_voltage)
}

/// Periodic power-ratio reporter for every heater channel.
pub struct HeaterMetering {
    client: ItcClient,
    registry: Arc<ChannelRegistry>,
    power: Arc<PowerRatioCalculator>,
    connection: watch::Receiver<ConnectionState>,
    feed: FeedSender,
    attempts: u32,
    settle: Duration,
}

impl HeaterMetering {
    /// Create a metering worker.
    pub fn new(
        client: ItcClient,
        registry: Arc<ChannelRegistry>,
        power: Arc<PowerRatioCalculator>,
        connection: watch::Receiver<ConnectionState>,
        feed: FeedSender,
    ) -> Self {
        Self {
            client,
            registry,
            power,
            connection,
            feed,
            attempts: 5,
            settle: Duration::from_secs(1),
        }
    }

    /// Attempts per calibration read.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Pause between consecutive heater reads.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn connected(&self) -> bool {
        *self.connection.borrow() == ConnectionState::Connected
    }

    /// Read and store voltage limit and resistance of every heater.
    pub async fn calibrate(&self) {
        for heater in self.registry.heaters() {
            let max_voltage = self
                .client
                .read_value(&heater.address, Command::VoltageLimit, self.attempts)
                .await
                .ok()
                .and_then(|value| value.magnitude());
            let resistance = self
                .client
                .read_value(&heater.address, Command::Resistance, self.attempts)
                .await
                .ok()
                .and_then(|value| value.magnitude());

            if let Some(limit) = max_voltage {
                if let Err(err) = self.registry.record_max_voltage(&heater.id, limit) {
                    tracing::warn!(channel = %heater.id, error = %err, "voltage limit not recorded");
                }
            }
            if let Some(ohms) = resistance {
                if let Err(err) = self.registry.record_resistance(&heater.id, ohms) {
                    tracing::warn!(channel = %heater.id, error = %err, "resistance not recorded");
                }
            }
            if max_voltage.is_none() || resistance.is_none() {
                tracing::warn!(channel = %heater.id, ?max_voltage, ?resistance, "heater calibration incomplete");
            }

            emit(
                &self.feed,
                FeedEvent::Calibration {
                    channel_id: heater.id.clone(),
                    max_voltage,
                    resistance,
                },
            );
        }
    }

    /// One metering pass over all heaters. Returns the number of ratios emitted.
    pub async fn meter(&self, control: &WorkerControl) -> usize {
        let mut emitted = 0;
        for (idx, heater) in self.registry.heaters().iter().enumerate() {
            if idx > 0 && !control.sleep(self.settle).await {
                break;
            }
            if let Some(ratio) =
                read_power_ratio(&self.client, &self.registry, &self.power, heater).await
            {
                emit(
                    &self.feed,
                    FeedEvent::Update(ChannelUpdate::new(&heater.id, FeedValue::PowerRatio(ratio))),
                );
                emitted += 1;
            }
        }
        emitted
    }

    /// Calibrate, then meter every `period` until paused or disconnected.
    /// A disconnected instrument ends the loop without any ratio update.
    pub async fn run(self, control: WorkerControl, period: Duration) {
        tracing::info!("heater metering started");

        if self.connected() && control.is_running() {
            self.calibrate().await;
        }

        while control.is_running() {
            // The poller reports N/A for the heater channels.
            if !self.connected() {
                tracing::info!("heater metering halted: instrument not connected");
                break;
            }
            self.meter(&control).await;
            if !control.sleep(period).await {
                break;
            }
        }

        emit(&self.feed, FeedEvent::Ended(WorkerKind::Metering));
        tracing::info!("heater metering ended");
    }
}
