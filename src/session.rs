//! Top-level session: connection state, worker lifecycle and command handling.
//!
//! `ItcSession` is the only writer of [`ConnectionState`]; every worker holds a
//! `watch::Receiver` and reads it at the top of each tick. Workers are spawned
//! as independent tokio tasks sharing one [`WorkerControl`]; pausing sets the
//! flag and waits for each task to report its end, so an in-flight transaction
//! always completes first.
//!
//! The session can be driven directly (`connect`, `resume`, `submit`, ...) or
//! as an actor consuming [`SessionCommand`]s through [`ItcSession::run`].

use crate::client::ItcClient;
use crate::config::ItcConfig;
use crate::control_panel::ControlPanelFetch;
use crate::error::{ItcError, ItcResult};
use crate::hardware::link::{SerialLinkBuilder, SharedLink};
use crate::messages::{
    emit, FeedReceiver, FeedSender, SessionCommand, StatusReceiver, StatusSender, WriteStatus,
};
use crate::metering::HeaterMetering;
use crate::power::PowerRatioCalculator;
use crate::registry::ChannelRegistry;
use crate::scheduler::PollScheduler;
use crate::worker::WorkerControl;
use crate::writer::{WriteCommand, WriteCoordinator};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Whether the instrument link is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No instrument attached, or the link could not be opened
    Disconnected,
    /// Link open
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Consumer ends of the session feeds.
pub struct SessionFeeds {
    /// Channel updates, loop settings, calibration, worker ends
    pub updates: FeedReceiver,
    /// One line per submitted write
    pub statuses: StatusReceiver,
}

/// Owner of the link, the registry and the periodic workers.
pub struct ItcSession {
    config: ItcConfig,
    client: ItcClient,
    registry: Arc<ChannelRegistry>,
    power: Arc<PowerRatioCalculator>,
    state: watch::Sender<ConnectionState>,
    feed: FeedSender,
    status: StatusSender,
    writer: WriteCoordinator,
    control: WorkerControl,
    workers: Vec<JoinHandle<()>>,
}

impl ItcSession {
    /// Session over an existing link. Starts disconnected with no workers.
    pub fn new(config: ItcConfig, link: SharedLink) -> ItcResult<(Self, SessionFeeds)> {
        config.validate()?;
        let registry = Arc::new(config.registry()?);
        let client = ItcClient::new(link);
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (feed, updates) = mpsc::unbounded_channel();
        let (status, statuses) = mpsc::unbounded_channel();

        let writer = WriteCoordinator::new(client.clone(), registry.clone(), state_rx)
            .with_max_attempts(config.writer.max_attempts);

        let control = WorkerControl::new();
        control.pause();

        let session = Self {
            config,
            client,
            registry,
            power: Arc::new(PowerRatioCalculator::new()),
            state,
            feed,
            status,
            writer,
            control,
            workers: Vec::new(),
        };
        Ok((session, SessionFeeds { updates, statuses }))
    }

    /// Session over the serial link named in the configuration.
    pub fn from_config(config: ItcConfig) -> ItcResult<(Self, SessionFeeds)> {
        let link = SerialLinkBuilder::from_config(&config.link)?.build();
        Self::new(config, SharedLink::new(link))
    }

    /// Current connection state.
    pub fn connection(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The channel registry.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Transaction handle on the link.
    pub fn client(&self) -> &ItcClient {
        &self.client
    }

    /// Whether workers are currently allowed to run.
    pub fn workers_running(&self) -> bool {
        self.control.is_running()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(%previous, current = %state, "connection state changed");
        }
    }

    /// Open the link. Failure leaves the session disconnected.
    pub async fn connect(&mut self) -> ConnectionState {
        match self.client.link().open().await {
            Ok(()) => {
                tokio::time::sleep(self.config.link.settle).await;
                self.set_state(ConnectionState::Connected);
            }
            Err(err) => {
                tracing::warn!(error = %err, "instrument not reachable");
                self.set_state(ConnectionState::Disconnected);
            }
        }
        self.connection()
    }

    /// Close the link. Running workers emit `N/A` on their next tick and stop.
    pub async fn disconnect(&mut self) {
        self.client.link().close().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// `*IDN?`.
    pub async fn identify(&self) -> ItcResult<String> {
        self.require_connection()?;
        self.client.identify().await
    }

    /// `READ:SYS:CAT`, split into device addresses.
    pub async fn devices(&self) -> ItcResult<Vec<String>> {
        self.require_connection()?;
        self.client.catalog().await
    }

    fn require_connection(&self) -> ItcResult<()> {
        match self.connection() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(ItcError::NotConnected),
        }
    }

    /// Spawn poller, metering and control panel fetch with a fresh run flag.
    pub fn start_workers(&mut self) {
        let control = WorkerControl::new();
        self.control = control.clone();
        let timing = &self.config.scheduler;
        let attempts = self.config.writer.max_attempts;

        let poller = PollScheduler::new(
            self.client.clone(),
            self.registry.clone(),
            self.power.clone(),
            self.state.subscribe(),
            self.feed.clone(),
        )
        .with_handoff_ticks(timing.handoff_ticks);

        let metering = HeaterMetering::new(
            self.client.clone(),
            self.registry.clone(),
            self.power.clone(),
            self.state.subscribe(),
            self.feed.clone(),
        )
        .with_attempts(attempts)
        .with_settle(timing.metering_recycle_delay);

        let panel = ControlPanelFetch::new(
            self.client.clone(),
            self.registry.clone(),
            self.state.subscribe(),
            self.feed.clone(),
        )
        .with_attempts(attempts);

        self.workers.push(tokio::spawn(poller.run(control.clone(), timing.poll_interval)));
        self.workers.push(tokio::spawn(metering.run(control.clone(), timing.metering_interval)));
        self.workers.push(tokio::spawn(panel.run(control)));
        tracing::info!("workers started");
    }

    /// Stop every worker and wait for each to end.
    pub async fn pause(&mut self) {
        self.control.pause();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker task failed");
            }
        }
    }

    /// Restart the workers.
    pub async fn resume(&mut self) {
        self.pause().await;
        self.start_workers();
    }

    /// Make `sensor` and its heater the primary pair, then restart the workers.
    pub async fn select_primary(&mut self, sensor: &str) -> ItcResult<()> {
        let was_running = self.workers_running();
        self.pause().await;
        let result = self.registry.select_primary(sensor);
        if was_running {
            self.start_workers();
        }
        result
    }

    /// Submit a write; the status also goes to the status feed.
    pub async fn submit(&self, command: &WriteCommand, channel: &str) -> WriteStatus {
        let status = self.writer.submit(command, channel).await;
        emit(&self.status, status.clone());
        status
    }

    /// Stop the workers and close the link.
    pub async fn shutdown(&mut self) {
        self.pause().await;
        self.disconnect().await;
        tracing::info!("session shut down");
    }

    /// Process commands until `Shutdown` or until every sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        tracing::info!("session started");
        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Pause { response } => {
                    self.pause().await;
                    let _ = response.send(());
                }
                SessionCommand::Resume { response } => {
                    self.resume().await;
                    let _ = response.send(());
                }
                SessionCommand::SelectPrimary { sensor, response } => {
                    let result = self.select_primary(&sensor).await;
                    let _ = response.send(result);
                }
                SessionCommand::Write { command, channel } => {
                    self.submit(&command, &channel).await;
                }
                SessionCommand::Shutdown { response } => {
                    self.shutdown().await;
                    let _ = response.send(());
                    return;
                }
            }
        }
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLink;
    use std::time::Duration;

    fn test_config() -> ItcConfig {
        let mut config = ItcConfig::default();
        config.link.settle = Duration::ZERO;
        config
    }

    #[tokio::test]
    async fn starts_disconnected_and_connects() {
        let (mut session, _feeds) =
            ItcSession::new(test_config(), SharedLink::new(MockLink::simulated())).unwrap();
        assert_eq!(session.connection(), ConnectionState::Disconnected);
        assert!(!session.workers_running());

        assert_eq!(session.connect().await, ConnectionState::Connected);
        assert!(session.identify().await.unwrap().contains("MERCURY ITC"));
        assert_eq!(session.devices().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unreachable_instrument_stays_disconnected() {
        let mock = MockLink::simulated();
        mock.reachability().set(false);
        let (mut session, _feeds) = ItcSession::new(test_config(), SharedLink::new(mock)).unwrap();

        assert_eq!(session.connect().await, ConnectionState::Disconnected);
        assert!(matches!(session.identify().await, Err(ItcError::NotConnected)));
    }

    #[tokio::test]
    async fn writes_report_on_the_status_feed() {
        let (mut session, mut feeds) =
            ItcSession::new(test_config(), SharedLink::new(MockLink::simulated())).unwrap();

        let status = session.submit(&WriteCommand::SetPoint(80.0), "MB1").await;
        assert_eq!(status.message, "ITC not connected");

        session.connect().await;
        let status = session.submit(&WriteCommand::SetPoint(80.0), "MB1").await;
        assert!(status.accepted);
        assert_eq!(status.message, "set point write succeeded");

        assert_eq!(feeds.statuses.recv().await.unwrap().message, "ITC not connected");
        assert_eq!(
            feeds.statuses.recv().await.unwrap().message,
            "set point write succeeded"
        );
    }

    #[tokio::test]
    async fn select_primary_swaps_pairs_without_starting_idle_workers() {
        let (mut session, _feeds) =
            ItcSession::new(test_config(), SharedLink::new(MockLink::simulated())).unwrap();
        session.select_primary("DB6").await.unwrap();
        assert_eq!(
            session.registry().primary_sensor().map(|c| c.id),
            Some("DB6".to_string())
        );
        assert!(!session.workers_running());
        assert!(session.select_primary("DB4").await.is_err());
    }
}
