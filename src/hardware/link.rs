//! The single physical link to the instrument.
//!
//! The controller firmware serves one outstanding request at a time and hands
//! back stale responses when transactions are issued back-to-back on the same
//! session. Every transaction is therefore followed by a [`Link::recycle`]
//! (close + reopen). Opening an open link and closing a closed one are no-ops.
//!
//! [`SharedLink`] is the only way the rest of the crate reaches a link: it
//! serializes all access behind one async mutex so a worker's
//! `(operation, recycle)` sequence can never interleave with another's.

use super::resource::resolve_port;
use crate::config::LinkConfig;
use crate::error::{ItcError, ItcResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

#[cfg(feature = "instrument_serial")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Byte transport to the instrument.
#[async_trait]
pub trait Link: Send {
    /// Human-readable resource name for logs.
    fn describe(&self) -> String;

    /// Whether the underlying session is currently open.
    fn is_open(&self) -> bool;

    /// Open the session. No-op when already open.
    async fn open(&mut self) -> ItcResult<()>;

    /// Close the session. No-op when already closed.
    async fn close(&mut self);

    /// Write raw bytes (terminator included).
    async fn write(&mut self, bytes: &[u8]) -> ItcResult<()>;

    /// Read one raw response, terminator included.
    async fn read_raw(&mut self) -> ItcResult<Vec<u8>>;

    /// Close then reopen. Open failures are logged and swallowed; the next
    /// transaction surfaces them as [`ItcError::LinkNotOpen`].
    async fn recycle(&mut self) {
        self.close().await;
        if let Err(err) = self.open().await {
            tracing::warn!(link = %self.describe(), error = %err, "reopen after recycle failed");
        }
    }
}

/// Mutex-guarded single owner of the link.
#[derive(Clone)]
pub struct SharedLink {
    inner: Arc<Mutex<Box<dyn Link>>>,
}

impl SharedLink {
    /// Take ownership of a link.
    pub fn new<L: Link + 'static>(link: L) -> Self {
        Self::from_boxed(Box::new(link))
    }

    /// Take ownership of an already boxed link.
    pub fn from_boxed(link: Box<dyn Link>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(link)),
        }
    }

    /// Acquire exclusive access for one transaction.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Link>> {
        self.inner.lock().await
    }

    /// Open the link under the lock.
    pub async fn open(&self) -> ItcResult<()> {
        self.lock().await.open().await
    }

    /// Close the link under the lock.
    pub async fn close(&self) {
        self.lock().await.close().await;
    }

    /// Recycle outside of a transaction.
    pub async fn recycle(&self) {
        self.lock().await.recycle().await;
    }
}

/// Builder for [`SerialLink`].
///
/// Default configuration:
/// * baud rate: 9600, 8N1, no flow control
/// * read timeout: 2 seconds
pub struct SerialLinkBuilder {
    resource: String,
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialLinkBuilder {
    /// `resource` is kept for logging; `port_name` is the OS device path.
    pub fn new(resource: impl Into<String>, port_name: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            port_name: port_name.into(),
            baud_rate: 9600,
            timeout: Duration::from_secs(2),
        }
    }

    /// Builder for the resource named in the `link` configuration section.
    pub fn from_config(config: &LinkConfig) -> ItcResult<Self> {
        let resource = config.resource.as_deref().ok_or_else(|| {
            ItcError::Configuration("link.resource is not set".to_string())
        })?;
        let port_name = resolve_port(resource)?;
        Ok(Self::new(resource, port_name)
            .with_baud_rate(config.baud_rate)
            .with_timeout(config.read_timeout))
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the per-response read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the (still closed) link.
    pub fn build(self) -> SerialLink {
        SerialLink {
            resource: self.resource,
            port_name: self.port_name,
            baud_rate: self.baud_rate,
            timeout: self.timeout,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }
}

/// RS-232 / USB-serial link backed by tokio-serial.
pub struct SerialLink {
    resource: String,
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Option<SerialStream>,
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Link for SerialLink {
    fn describe(&self) -> String {
        format!("{} ({} @ {} baud)", self.resource, self.port_name, self.baud_rate)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self) -> ItcResult<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let opened = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port_name, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await;

        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(ItcError::Open {
                    resource: self.resource.clone(),
                    reason: err.to_string(),
                })
            }
            Err(join) => {
                return Err(ItcError::Open {
                    resource: self.resource.clone(),
                    reason: format!("open task failed: {join}"),
                })
            }
        };

        tracing::trace!(link = %self.describe(), "opened");
        self.port = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::trace!(link = %self.describe(), "closed");
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> ItcResult<()> {
        let port = self.port.as_mut().ok_or(ItcError::LinkNotOpen)?;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read_raw(&mut self) -> ItcResult<Vec<u8>> {
        let timeout = self.timeout;
        let port = self.port.as_mut().ok_or(ItcError::LinkNotOpen)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut response = Vec::new();
        let mut buffer = [0u8; 256];

        while !response.contains(&b'\n') {
            let n = tokio::time::timeout_at(deadline, port.read(&mut buffer))
                .await
                .map_err(|_| ItcError::Timeout(timeout))??;
            if n == 0 {
                return Err(ItcError::LinkClosed);
            }
            response.extend_from_slice(&buffer[..n]);
        }

        Ok(response)
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Link for SerialLink {
    fn describe(&self) -> String {
        format!("{} ({} @ {} baud)", self.resource, self.port_name, self.baud_rate)
    }

    fn is_open(&self) -> bool {
        false
    }

    async fn open(&mut self) -> ItcResult<()> {
        let _ = self.timeout;
        Err(ItcError::SerialFeatureDisabled)
    }

    async fn close(&mut self) {}

    async fn write(&mut self, _bytes: &[u8]) -> ItcResult<()> {
        Err(ItcError::SerialFeatureDisabled)
    }

    async fn read_raw(&mut self) -> ItcResult<Vec<u8>> {
        Err(ItcError::SerialFeatureDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{LinkOp, MockLink};

    #[test]
    fn serial_link_builder_defaults() {
        let link = SerialLinkBuilder::new("ASRL3::INSTR", "/dev/ttyS3").build();
        assert_eq!(link.baud_rate, 9600);
        assert_eq!(link.timeout, Duration::from_secs(2));
        assert!(!link.is_open());
        assert!(link.describe().contains("ASRL3::INSTR"));
    }

    #[test]
    fn serial_link_builder_customization() {
        let link = SerialLinkBuilder::new("COM3", "COM3")
            .with_baud_rate(115_200)
            .with_timeout(Duration::from_millis(500))
            .build();
        assert_eq!(link.baud_rate, 115_200);
        assert_eq!(link.timeout, Duration::from_millis(500));
    }

    #[test]
    fn serial_link_builder_from_config() {
        let mut config = LinkConfig::default();
        assert!(SerialLinkBuilder::from_config(&config).is_err());

        config.resource = Some("ASRL/dev/ttyUSB0::INSTR".into());
        config.baud_rate = 57_600;
        let link = SerialLinkBuilder::from_config(&config).unwrap().build();
        assert_eq!(link.port_name, "/dev/ttyUSB0");
        assert_eq!(link.baud_rate, 57_600);
    }

    #[tokio::test]
    async fn closing_a_closed_serial_link_is_a_no_op() {
        let mut link = SerialLinkBuilder::new("none", "/dev/does-not-exist").build();
        link.close().await;
        link.close().await;
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn recycle_closes_then_reopens() {
        let mock = MockLink::new(|_| None);
        let journal = mock.journal();
        let shared = SharedLink::new(mock);

        shared.open().await.unwrap();
        shared.recycle().await;

        assert_eq!(journal.ops(), vec![LinkOp::Open, LinkOp::Close, LinkOp::Open]);
        assert!(shared.lock().await.is_open());
    }

    #[tokio::test]
    async fn recycle_swallows_reopen_failure() {
        let mock = MockLink::new(|_| None);
        let reachable = mock.reachability();
        let shared = SharedLink::new(mock);
        shared.open().await.unwrap();

        reachable.set(false);
        shared.recycle().await;

        let mut link = shared.lock().await;
        assert!(!link.is_open());
        assert!(matches!(link.write(b"*IDN?\n\r").await, Err(ItcError::LinkNotOpen)));
    }
}
