//! One-shot fetch of the loop settings of the primary temperature sensor.

use crate::client::ItcClient;
use crate::messages::{emit, FeedEvent, FeedSender, WorkerKind};
use crate::protocol::Command;
use crate::registry::ChannelRegistry;
use crate::session::ConnectionState;
use crate::worker::WorkerControl;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Loop settings shown on the control panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoopParameter {
    /// Manual heater percentage
    HeaterPercent,
    /// Manual gas-flow percentage
    FlowPercent,
    /// Temperature set point
    SetPoint,
    /// Proportional gain
    P,
    /// Integral gain
    I,
    /// Derivative gain
    D,
}

impl LoopParameter {
    /// Fetch order.
    pub const ALL: [LoopParameter; 6] = [
        LoopParameter::HeaterPercent,
        LoopParameter::FlowPercent,
        LoopParameter::SetPoint,
        LoopParameter::P,
        LoopParameter::I,
        LoopParameter::D,
    ];

    /// Command node read.
    pub fn command(self) -> Command {
        match self {
            LoopParameter::HeaterPercent => Command::HeaterPercent,
            LoopParameter::FlowPercent => Command::FlowPercent,
            LoopParameter::SetPoint => Command::SetPoint,
            LoopParameter::P => Command::LoopP,
            LoopParameter::I => Command::LoopI,
            LoopParameter::D => Command::LoopD,
        }
    }
}

impl fmt::Display for LoopParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopParameter::HeaterPercent => "Heat",
            LoopParameter::FlowPercent => "Flow",
            LoopParameter::SetPoint => "Set Point",
            LoopParameter::P => "P",
            LoopParameter::I => "I",
            LoopParameter::D => "D",
        };
        f.write_str(label)
    }
}

/// Reads the loop settings once and reports them on the feed.
pub struct ControlPanelFetch {
    client: ItcClient,
    registry: Arc<ChannelRegistry>,
    connection: watch::Receiver<ConnectionState>,
    feed: FeedSender,
    attempts: u32,
}

impl ControlPanelFetch {
    /// Create a fetch worker.
    pub fn new(
        client: ItcClient,
        registry: Arc<ChannelRegistry>,
        connection: watch::Receiver<ConnectionState>,
        feed: FeedSender,
    ) -> Self {
        Self {
            client,
            registry,
            connection,
            feed,
            attempts: 5,
        }
    }

    /// Attempts per setting.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Read every setting of the primary sensor. Returns how many were read.
    ///
    /// A setting that cannot be read within the attempt bound is skipped.
    pub async fn fetch(&self, control: &WorkerControl) -> usize {
        let Some(sensor) = self.registry.primary_sensor() else {
            tracing::warn!("no primary temperature sensor, nothing to fetch");
            return 0;
        };

        let mut fetched = 0;
        for parameter in LoopParameter::ALL {
            if !control.is_running() {
                break;
            }
            match self
                .client
                .read_value(&sensor.address, parameter.command(), self.attempts)
                .await
            {
                Ok(value) => {
                    emit(
                        &self.feed,
                        FeedEvent::LoopSetting {
                            channel_id: sensor.id.clone(),
                            parameter,
                            value,
                        },
                    );
                    fetched += 1;
                }
                Err(err) => {
                    tracing::warn!(channel = %sensor.id, %parameter, error = %err, "loop setting unavailable");
                }
            }
        }
        fetched
    }

    /// Fetch once (when connected and running), then report the end.
    pub async fn run(self, control: WorkerControl) {
        if control.is_running() && *self.connection.borrow() == ConnectionState::Connected {
            let fetched = self.fetch(&control).await;
            tracing::debug!(fetched, "loop settings fetched");
        }
        emit(&self.feed, FeedEvent::Ended(WorkerKind::ControlPanel));
    }
}
