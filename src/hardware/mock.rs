//! In-memory link for tests and the `--simulate` monitor.
//!
//! [`MockLink`] implements [`Link`] on top of a responder closure and records
//! every call in a shared [`Journal`], so tests can assert on exact
//! `(operation, recycle)` sequences after the link has been moved into a
//! [`SharedLink`](super::link::SharedLink).
//!
//! [`SimulatedItc`] is a small model of the instrument (factory channel layout,
//! loop settings, drifting temperatures) usable as a responder.
//!
//! # Example
//!
//! ```rust
//! use mercury_itc::hardware::mock::{MockLink, SimulatedItc};
//!
//! let link = MockLink::new(SimulatedItc::default().into_responder());
//! let journal = link.journal();
//! assert!(journal.ops().is_empty());
//! ```

use super::link::Link;
use crate::error::{ItcError, ItcResult};
use crate::protocol::{self, WRITE_TERMINATOR};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Responder: request text (terminator stripped) → response line, or `None`
/// to simulate a read timeout.
pub type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// One recorded call on a [`MockLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    /// `open()`
    Open,
    /// `close()`
    Close,
    /// `write()` with the request text, terminator stripped
    Write(String),
    /// `read_raw()`
    Read,
}

/// Shared record of link calls.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    ops: Arc<Mutex<Vec<LinkOp>>>,
}

impl Journal {
    fn push(&self, op: LinkOp) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }

    /// Snapshot of every recorded call.
    pub fn ops(&self) -> Vec<LinkOp> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests written so far.
    pub fn writes(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                LinkOp::Write(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Number of close+open pairs.
    pub fn recycles(&self) -> usize {
        self.ops()
            .windows(2)
            .filter(|pair| pair[0] == LinkOp::Close && pair[1] == LinkOp::Open)
            .count()
    }

    /// Total number of calls of any kind.
    pub fn len(&self) -> usize {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Switch controlling whether `open()` succeeds.
#[derive(Debug, Clone)]
pub struct Reachability(Arc<AtomicBool>);

impl Reachability {
    /// Make the instrument reachable (or not).
    pub fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Scripted link.
pub struct MockLink {
    responder: Responder,
    open: bool,
    pending: Option<Vec<u8>>,
    journal: Journal,
    reachable: Reachability,
}

impl MockLink {
    /// Create a closed mock link answering through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            open: false,
            pending: None,
            journal: Journal::default(),
            reachable: Reachability(Arc::new(AtomicBool::new(true))),
        }
    }

    /// Mock link backed by a default [`SimulatedItc`].
    pub fn simulated() -> Self {
        Self::new(SimulatedItc::default().into_responder())
    }

    /// Handle to the call journal.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Handle controlling whether `open()` succeeds.
    pub fn reachability(&self) -> Reachability {
        self.reachable.clone()
    }
}

#[async_trait]
impl Link for MockLink {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> ItcResult<()> {
        self.journal.push(LinkOp::Open);
        if self.open {
            return Ok(());
        }
        if !self.reachable.get() {
            return Err(ItcError::Open {
                resource: "mock".into(),
                reason: "instrument unreachable".into(),
            });
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.push(LinkOp::Close);
        self.open = false;
        self.pending = None;
    }

    async fn write(&mut self, bytes: &[u8]) -> ItcResult<()> {
        let text = String::from_utf8_lossy(bytes);
        let request = text.trim_end_matches(WRITE_TERMINATOR).to_string();
        self.journal.push(LinkOp::Write(request.clone()));
        if !self.open {
            return Err(ItcError::LinkNotOpen);
        }
        self.pending = (self.responder)(&request).map(|line| format!("{line}\n").into_bytes());
        Ok(())
    }

    async fn read_raw(&mut self) -> ItcResult<Vec<u8>> {
        self.journal.push(LinkOp::Read);
        if !self.open {
            return Err(ItcError::LinkNotOpen);
        }
        self.pending.take().ok_or(ItcError::Timeout(Duration::ZERO))
    }
}

/// Minimal model of the instrument's factory configuration.
///
/// Reads of `SIG:TEMP` drift each temperature toward its loop set point;
/// heater voltages follow the heater percentage. Every writable node answers
/// `VALID` and stores the value. `INVALID` can be injected on every n-th request.
#[derive(Debug, Clone)]
pub struct SimulatedItc {
    identity: String,
    values: HashMap<String, String>,
    temperatures: HashMap<String, f64>,
    invalid_every: Option<u32>,
    requests: u32,
}

impl Default for SimulatedItc {
    fn default() -> Self {
        let mut values = HashMap::new();
        for sensor in ["DEV:MB1.T1:TEMP", "DEV:DB6.T1:TEMP"] {
            values.insert(format!("{sensor}:LOOP:TSET"), "300.0K".to_string());
            values.insert(format!("{sensor}:LOOP:HSET"), "10.0".to_string());
            values.insert(format!("{sensor}:LOOP:FSET"), "20.0".to_string());
            values.insert(format!("{sensor}:LOOP:P"), "5.0".to_string());
            values.insert(format!("{sensor}:LOOP:I"), "1.0".to_string());
            values.insert(format!("{sensor}:LOOP:D"), "0.0".to_string());
            values.insert(format!("{sensor}:LOOP:ENAB"), "ON".to_string());
            values.insert(format!("{sensor}:LOOP:FAUT"), "OFF".to_string());
            values.insert(format!("{sensor}:LOOP:SWMD"), "OFF".to_string());
            values.insert(format!("{sensor}:LOOP:SWFL"), "None".to_string());
        }
        for heater in ["DEV:MB0.H1:HTR", "DEV:DB1.H1:HTR"] {
            values.insert(format!("{heater}:VLIM"), "20.0V".to_string());
            values.insert(format!("{heater}:RES"), "80.0O".to_string());
        }
        values.insert("DEV:DB4.G1:AUX:SIG:PERC".to_string(), "20.0%".to_string());

        let temperatures = HashMap::from([
            ("DEV:MB1.T1:TEMP".to_string(), 290.0),
            ("DEV:DB6.T1:TEMP".to_string(), 285.0),
        ]);

        Self {
            identity: "IDN:OXFORD INSTRUMENTS:MERCURY ITC:SIMULATED:2.5.0".to_string(),
            values,
            temperatures,
            invalid_every: None,
            requests: 0,
        }
    }
}

impl SimulatedItc {
    /// Answer `INVALID` to every `n`-th request.
    pub fn with_invalid_every(mut self, n: u32) -> Self {
        self.invalid_every = Some(n.max(1));
        self
    }

    /// Box the model as a [`Responder`].
    pub fn into_responder(mut self) -> Responder {
        Box::new(move |request| self.respond(request))
    }

    /// Answer one request.
    pub fn respond(&mut self, request: &str) -> Option<String> {
        self.requests += 1;
        if request == protocol::IDENTIFY {
            return Some(self.identity.clone());
        }
        if let Some(n) = self.invalid_every {
            if self.requests % n == 0 {
                return Some(format!("STAT:{}:INVALID", strip_verb(request)));
            }
        }
        if request == "READ:SYS:CAT" {
            return Some(
                "STAT:SYS:CAT:DEV:MB1.T1:TEMP:DEV:DB6.T1:TEMP:DEV:MB0.H1:HTR:DEV:DB1.H1:HTR:DEV:DB4.G1:AUX"
                    .to_string(),
            );
        }
        if let Some(path) = request.strip_prefix("READ:") {
            let value = self.read(path).unwrap_or_else(|| protocol::INVALID.to_string());
            return Some(format!("STAT:{path}:{value}"));
        }
        if let Some(path) = request.strip_prefix("SET:") {
            let (node, value) = path.rsplit_once(':')?;
            let status = if self.values.contains_key(node) {
                self.values.insert(node.to_string(), value.to_string());
                protocol::VALID
            } else {
                protocol::INVALID
            };
            return Some(format!("STAT:SET:{path}:{status}"));
        }
        Some("STAT:INVALID".to_string())
    }

    fn read(&mut self, path: &str) -> Option<String> {
        if let Some(device) = path.strip_suffix(":SIG:TEMP") {
            let set_point = self
                .values
                .get(&format!("{device}:LOOP:TSET"))
                .and_then(|v| v.trim_end_matches('K').parse::<f64>().ok())?;
            let temperature = self.temperatures.get_mut(device)?;
            *temperature += (set_point - *temperature) * 0.1;
            return Some(format!("{:.4}K", temperature));
        }
        if let Some(device) = path.strip_suffix(":SIG:VOLT") {
            let limit = self
                .values
                .get(&format!("{device}:VLIM"))
                .and_then(|v| v.trim_end_matches('V').parse::<f64>().ok())?;
            let sensor = heater_sensor(device);
            let percent = self
                .values
                .get(&format!("{sensor}:LOOP:HSET"))
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            return Some(format!("{:.4}V", limit * (percent / 100.0).sqrt()));
        }
        self.values.get(path).cloned()
    }
}

fn strip_verb(request: &str) -> &str {
    request
        .strip_prefix("READ:")
        .or_else(|| request.strip_prefix("SET:"))
        .unwrap_or(request)
}

fn heater_sensor(heater: &str) -> &'static str {
    if heater.contains("MB0") {
        "DEV:MB1.T1:TEMP"
    } else {
        "DEV:DB6.T1:TEMP"
    }
}
