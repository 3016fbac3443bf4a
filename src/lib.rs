//! # Mercury ITC Core Library
//!
//! Headless control of a multi-channel temperature/heater controller reachable
//! through exactly one half-duplex serial link. The instrument serves one
//! request at a time and needs the link closed and reopened between
//! transactions; this crate multiplexes periodic channel reads, heater
//! metering and interactive writes onto that single link.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `ItcError` enum and `ItcResult` alias.
//! - **`config`**: figment-backed `ItcConfig` (defaults, TOML file, `MERCURY_ITC_` environment).
//! - **`logging`**: `tracing-subscriber` setup (pretty, compact or json).
//! - **`measurement`**: typed readings (`Reading`, `Unit`, `Value`) decoded at the protocol boundary.
//! - **`protocol`**: `READ:`/`SET:` encoding, response decoding, the command table.
//! - **`hardware`**: the `Link` trait, the mutex-guarded `SharedLink`, the tokio-serial
//!   link, resource-name resolution and the journaling mock link.
//! - **`client`**: `ItcClient`, one `(operation, recycle)` critical section per call.
//! - **`registry`**: `ChannelRegistry` (channels, tiers, pairing, heater calibration).
//! - **`power`**: heater power ratio with last-good caching.
//! - **`scheduler`**: the cyclic poll state machine.
//! - **`metering`**: heater calibration and periodic power ratios.
//! - **`control_panel`**: one-shot loop-settings fetch.
//! - **`writer`**: write command table and the retry-bounded `WriteCoordinator`.
//! - **`messages`**: update feed, write-status feed and session commands.
//! - **`worker`**: cooperative pause flag shared by the periodic loops.
//! - **`session`**: `ItcSession`, owner of the connection state and the workers.

pub mod client;
pub mod config;
pub mod control_panel;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod messages;
pub mod metering;
pub mod power;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod worker;
pub mod writer;

pub use error::{ItcError, ItcResult};
pub use session::{ConnectionState, ItcSession, SessionFeeds};
