//! Message types exchanged between the session, its workers and the consumer.
//!
//! # Feeds
//!
//! The core talks to the outside world through two unbounded mpsc feeds and
//! one command channel:
//!
//! ```text
//! workers ──FeedEvent──────▶ display consumer      (ordered channel updates)
//! writer  ──WriteStatus────▶ display consumer      (one status line per write)
//! operator ─SessionCommand─▶ ItcSession actor      (pause / resume / reconfigure / write)
//! ```
//!
//! Feed sends never fail the sender: a dropped consumer only means nobody is
//! watching, so the event is discarded with a trace log.
//!
//! # Commands
//!
//! Every [`SessionCommand`] that produces a result carries a `oneshot::Sender`.
//! Use the helper constructors, which return the matching receiver:
//!
//! ```rust
//! use mercury_itc::messages::SessionCommand;
//!
//! let (cmd, rx) = SessionCommand::select_primary("DB6".to_string());
//! // command_tx.send(cmd)?;
//! // let result = rx.await?;
//! # drop((cmd, rx));
//! ```

use crate::control_panel::LoopParameter;
use crate::error::ItcResult;
use crate::measurement::Value;
use crate::writer::WriteCommand;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Sentinel shown for a channel that cannot be read.
pub const UNAVAILABLE: &str = "N/A";

/// Periodic workers owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkerKind {
    /// Channel poll scheduler (1 s)
    Poller,
    /// Heater metering loop (3 s)
    Metering,
    /// One-shot loop-settings fetch
    ControlPanel,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Poller => f.write_str("poller"),
            WorkerKind::Metering => f.write_str("metering"),
            WorkerKind::ControlPanel => f.write_str("control panel"),
        }
    }
}

/// Payload of a channel update.
///
/// Serializes as its display text: `"23.4K"`, `"25.0%"` or `"N/A"`.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedValue {
    /// Fresh reading of the channel's signal
    Reading(Value),
    /// Heater power ratio in percent
    PowerRatio(f64),
    /// Channel cannot be read (`N/A`)
    Unavailable,
}

impl fmt::Display for FeedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedValue::Reading(value) => fmt::Display::fmt(value, f),
            FeedValue::PowerRatio(ratio) => write!(f, "{ratio:.1}%"),
            FeedValue::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

impl Serialize for FeedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// `(channel_id, value)` pair on the update feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelUpdate {
    /// Logical channel id
    pub channel_id: String,
    /// New value
    pub value: FeedValue,
    /// Time the value was produced
    pub timestamp: DateTime<Utc>,
}

impl ChannelUpdate {
    /// Timestamped update.
    pub fn new(channel_id: impl Into<String>, value: FeedValue) -> Self {
        Self {
            channel_id: channel_id.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Everything a worker reports to the display consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FeedEvent {
    /// Channel reading, power ratio or `N/A`
    Update(ChannelUpdate),
    /// Loop setting of a temperature channel (control panel fetch)
    LoopSetting {
        /// Temperature channel id
        channel_id: String,
        /// Which setting
        parameter: LoopParameter,
        /// Decoded value
        value: Value,
    },
    /// Heater calibration value (metering start-up)
    Calibration {
        /// Heater channel id
        channel_id: String,
        /// Voltage limit, if it could be read
        max_voltage: Option<f64>,
        /// Resistance, if it could be read
        resistance: Option<f64>,
    },
    /// Worker loop has exited
    Ended(WorkerKind),
}

/// Result of one submitted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteStatus {
    /// Whether the instrument confirmed the write
    pub accepted: bool,
    /// Human-readable status line
    pub message: String,
}

impl WriteStatus {
    /// Confirmed write.
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    /// Rejected or failed write.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Sender half of the update feed.
pub type FeedSender = mpsc::UnboundedSender<FeedEvent>;
/// Receiver half of the update feed.
pub type FeedReceiver = mpsc::UnboundedReceiver<FeedEvent>;
/// Sender half of the write-status feed.
pub type StatusSender = mpsc::UnboundedSender<WriteStatus>;
/// Receiver half of the write-status feed.
pub type StatusReceiver = mpsc::UnboundedReceiver<WriteStatus>;

/// Send on a feed, discarding the event if nobody listens.
pub(crate) fn emit<T: fmt::Debug>(feed: &mpsc::UnboundedSender<T>, event: T) {
    if let Err(err) = feed.send(event) {
        tracing::trace!(event = ?err.0, "feed consumer gone, event dropped");
    }
}

/// Commands accepted by the session actor (see [`crate::session`]).
#[derive(Debug)]
pub enum SessionCommand {
    /// Stop every periodic worker at its next check.
    Pause {
        /// Acknowledged once the flag is set
        response: oneshot::Sender<()>,
    },

    /// Restart the periodic workers (and the one-shot control panel fetch).
    ///
    /// A halted poller (after a disconnected tick) only runs again through this.
    Resume {
        /// Acknowledged once the workers are spawned
        response: oneshot::Sender<()>,
    },

    /// Make a temperature sensor and its heater the primary pair.
    ///
    /// Workers are paused, the registry updated in one step, then workers resumed.
    SelectPrimary {
        /// Temperature channel id
        sensor: String,
        /// Fails for channels outside the pairing table
        response: oneshot::Sender<ItcResult<()>>,
    },

    /// Submit a write. The status line goes to the write-status feed.
    Write {
        /// What to write
        command: WriteCommand,
        /// Logical channel id
        channel: String,
    },

    /// Stop everything and close the link.
    Shutdown {
        /// Acknowledged after the link is closed
        response: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    /// Helper to create a Pause command
    pub fn pause() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Helper to create a Resume command
    pub fn resume() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Helper to create a SelectPrimary command
    pub fn select_primary(sensor: String) -> (Self, oneshot::Receiver<ItcResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SelectPrimary {
                sensor,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Write command
    pub fn write(command: WriteCommand, channel: String) -> Self {
        Self::Write { command, channel }
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
