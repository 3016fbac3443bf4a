//! Cyclic poll scheduler.
//!
//! One tick, for every channel in registry order:
//! - Primary channels are read every tick.
//! - Secondary channels are read only when `secondary_phase == 0`.
//! - Heater channels additionally report a power ratio when `meter_phase == 1`,
//!   whatever their tier.
//!
//! Each read is a complete `(read, recycle)` transaction. After the channels,
//! the hand-off counter runs while the gas-flow channel is Primary and demotes
//! it on the configured tick; then both phases advance modulo
//! [`PollCycle::PHASES`].
//!
//! A tick while disconnected emits `N/A` for every channel and halts the loop;
//! only a fresh start (session resume) polls again.

use crate::client::ItcClient;
use crate::messages::{emit, ChannelUpdate, FeedEvent, FeedSender, FeedValue, WorkerKind};
use crate::metering::read_power_ratio;
use crate::power::PowerRatioCalculator;
use crate::protocol::{Command, Reply};
use crate::registry::{Channel, ChannelRegistry, Tier};
use crate::session::ConnectionState;
use crate::worker::WorkerControl;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default ticks the gas-flow channel stays Primary.
pub const DEFAULT_HANDOFF_TICKS: u32 = 10;

/// Phase counters driving channel selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCycle {
    secondary_phase: u8,
    meter_phase: u8,
    handoff_counter: u32,
}

impl PollCycle {
    /// Both phases wrap at this value.
    pub const PHASES: u8 = 4;

    /// Current secondary phase, in `[0, PHASES)`.
    pub fn secondary_phase(&self) -> u8 {
        self.secondary_phase
    }

    /// Current meter phase, in `[0, PHASES)`.
    pub fn meter_phase(&self) -> u8 {
        self.meter_phase
    }

    /// Ticks counted so far while the gas-flow channel was Primary.
    pub fn handoff_counter(&self) -> u32 {
        self.handoff_counter
    }

    /// Secondary channels are read on this tick.
    pub fn reads_secondary(&self) -> bool {
        self.secondary_phase == 0
    }

    /// Heater power ratios are read on this tick.
    pub fn reads_power_ratio(&self) -> bool {
        self.meter_phase == 1
    }

    fn advance(&mut self) {
        self.secondary_phase = (self.secondary_phase + 1) % Self::PHASES;
        self.meter_phase = (self.meter_phase + 1) % Self::PHASES;
    }

    /// Count one Primary tick; `true` when the hand-off is due.
    fn count_handoff(&mut self, limit: u32) -> bool {
        self.handoff_counter += 1;
        if self.handoff_counter >= limit {
            self.handoff_counter = 0;
            true
        } else {
            false
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Channels were polled; `transactions` link transactions were issued.
    Polled {
        /// Number of `(operation, recycle)` transactions
        transactions: usize,
    },
    /// Disconnected: `N/A` emitted, the loop must stop.
    Halted,
}

/// The polling state machine.
pub struct PollScheduler {
    client: ItcClient,
    registry: Arc<ChannelRegistry>,
    power: Arc<PowerRatioCalculator>,
    connection: watch::Receiver<ConnectionState>,
    feed: FeedSender,
    cycle: PollCycle,
    handoff_ticks: u32,
}

impl PollScheduler {
    /// Create a scheduler at phase zero.
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
            cycle: PollCycle::default(),
            handoff_ticks: DEFAULT_HANDOFF_TICKS,
        }
    }

    /// Override the hand-off tick count.
    pub fn with_handoff_ticks(mut self, ticks: u32) -> Self {
        self.handoff_ticks = ticks.max(1);
        self
    }

    /// Current phase counters.
    pub fn cycle(&self) -> PollCycle {
        self.cycle
    }

    /// Run one tick.
    pub async fn tick(&mut self) -> TickOutcome {
        let channels = self.registry.snapshot();

        if *self.connection.borrow() != ConnectionState::Connected {
            for channel in &channels {
                emit(
                    &self.feed,
                    FeedEvent::Update(ChannelUpdate::new(&channel.id, FeedValue::Unavailable)),
                );
            }
            return TickOutcome::Halted;
        }

        let mut transactions = 0;
        for channel in &channels {
            let regular = match channel.tier {
                Tier::Primary => true,
                Tier::Secondary => self.cycle.reads_secondary(),
            };
            if regular {
                self.poll_channel(channel).await;
                transactions += 1;
            }
            if channel.is_heater() && self.cycle.reads_power_ratio() {
                let calibrated = self
                    .registry
                    .calibration(&channel.id)
                    .and_then(|cal| cal.max_voltage)
                    .is_some();
                if let Some(ratio) =
                    read_power_ratio(&self.client, &self.registry, &self.power, channel).await
                {
                    emit(
                        &self.feed,
                        FeedEvent::Update(ChannelUpdate::new(
                            &channel.id,
                            FeedValue::PowerRatio(ratio),
                        )),
                    );
                }
                transactions += if calibrated { 1 } else { 2 };
            }
        }

        if self.registry.gas_flow_is_primary() && self.cycle.count_handoff(self.handoff_ticks) {
            self.registry.set_gas_flow_tier(Tier::Secondary);
        }
        self.cycle.advance();

        TickOutcome::Polled { transactions }
    }

    async fn poll_channel(&self, channel: &Channel) {
        let command = Command::Signal(channel.measurement);
        match self.client.read(&channel.address, command).await {
            Ok(Reply::Value(value)) => {
                if let Err(err) = self.registry.record_reading(&channel.id, value.clone()) {
                    tracing::warn!(channel = %channel.id, error = %err, "reading not recorded");
                }
                emit(
                    &self.feed,
                    FeedEvent::Update(ChannelUpdate::new(&channel.id, FeedValue::Reading(value))),
                );
            }
            Ok(Reply::Invalid) => {
                tracing::debug!(channel = %channel.id, "INVALID reading, keeping last known value");
            }
            Err(err) => {
                tracing::debug!(channel = %channel.id, error = %err, "read failed, keeping last known value");
            }
        }
    }

    /// Tick every `period` until paused or disconnected.
    pub async fn run(mut self, control: WorkerControl, period: Duration) {
        tracing::info!(period = ?period, "poll scheduler started");
        while control.is_running() {
            if self.tick().await == TickOutcome::Halted {
                tracing::info!("poll scheduler halted: instrument not connected");
                break;
            }
            if !control.sleep(period).await {
                break;
            }
        }
        emit(&self.feed, FeedEvent::Ended(WorkerKind::Poller));
        tracing::info!("poll scheduler ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_wrap_modulo_four() {
        let mut cycle = PollCycle::default();
        let mut seen = Vec::new();
        for _ in 0..9 {
            seen.push((cycle.secondary_phase(), cycle.meter_phase()));
            cycle.advance();
        }
        assert_eq!(
            seen,
            vec![(0, 0), (1, 1), (2, 2), (3, 3), (0, 0), (1, 1), (2, 2), (3, 3), (0, 0)]
        );
    }

    #[test]
    fn secondary_and_ratio_ticks_never_coincide() {
        let mut cycle = PollCycle::default();
        for _ in 0..16 {
            assert!(!(cycle.reads_secondary() && cycle.reads_power_ratio()));
            assert!(cycle.secondary_phase() < PollCycle::PHASES);
            cycle.advance();
        }
    }

    #[test]
    fn handoff_fires_on_the_limit_and_resets() {
        let mut cycle = PollCycle::default();
        for _ in 0..9 {
            assert!(!cycle.count_handoff(10));
        }
        assert_eq!(cycle.handoff_counter(), 9);
        assert!(cycle.count_handoff(10));
        assert_eq!(cycle.handoff_counter(), 0);
    }
}
