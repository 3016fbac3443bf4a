//! Hardware access
//!
//! Low-level communication with the instrument: the link abstraction, the
//! tokio-serial implementation, resource-name resolution and an in-memory
//! link for tests and simulation.

pub mod link;
pub mod mock;
pub mod resource;

pub use link::{Link, SerialLink, SerialLinkBuilder, SharedLink};
pub use mock::{Journal, LinkOp, MockLink, SimulatedItc};
