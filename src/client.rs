//! Transaction layer over the shared link.
//!
//! Every public operation on [`ItcClient`] is one critical section: the link
//! mutex is taken, the request is exchanged, the link is recycled, and only
//! then is the mutex released. No other worker can slip a transaction in
//! between an operation and its recycle.

use crate::error::{ItcError, ItcResult};
use crate::hardware::link::SharedLink;
use crate::measurement::Value;
use crate::protocol::{self, Command, Reply, SetOutcome};

/// Cheap-to-clone handle used by every worker.
#[derive(Clone)]
pub struct ItcClient {
    link: SharedLink,
}

impl ItcClient {
    /// Wrap a shared link.
    pub fn new(link: SharedLink) -> Self {
        Self { link }
    }

    /// The underlying link.
    pub fn link(&self) -> &SharedLink {
        &self.link
    }

    /// `READ:<address>:<command>` followed by a recycle.
    pub async fn read(&self, address: &str, command: Command) -> ItcResult<Reply> {
        let mut link = self.link.lock().await;
        let result = protocol::read(&mut **link, address, &command.path()).await;
        link.recycle().await;
        if let Err(err) = &result {
            tracing::warn!(address, command = %command.path(), error = %err, "read failed");
        }
        result
    }

    /// `SET:<address>:<command>:<value>` followed by a recycle.
    pub async fn set(&self, address: &str, command: Command, value: &str) -> ItcResult<SetOutcome> {
        let mut link = self.link.lock().await;
        let result = protocol::set(&mut **link, address, &command.path(), value).await;
        link.recycle().await;
        result
    }

    /// Read a value, retrying `INVALID` answers and transient errors.
    ///
    /// Each attempt is its own `(read, recycle)` transaction.
    pub async fn read_value(
        &self,
        address: &str,
        command: Command,
        attempts: u32,
    ) -> ItcResult<Value> {
        let mut last_error = ItcError::InvalidResponse(protocol::encode_read(address, &command.path()));
        for attempt in 1..=attempts.max(1) {
            match self.read(address, command).await {
                Ok(Reply::Value(value)) => return Ok(value),
                Ok(Reply::Invalid) => {
                    tracing::debug!(address, command = %command.path(), attempt, "instrument answered INVALID");
                }
                Err(err) if err.is_transient() => {
                    tracing::debug!(address, command = %command.path(), attempt, error = %err, "transient read failure");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    /// `*IDN?` followed by a recycle. Returns the raw identification line.
    pub async fn identify(&self) -> ItcResult<String> {
        let mut link = self.link.lock().await;
        let result = protocol::query(&mut **link, protocol::IDENTIFY).await;
        link.recycle().await;
        result
    }

    /// `READ:SYS:CAT` followed by a recycle. Returns the `DEV:` addresses.
    pub async fn catalog(&self) -> ItcResult<Vec<String>> {
        let mut link = self.link.lock().await;
        let request = format!("READ:{}", protocol::CATALOG);
        let result = protocol::query(&mut **link, &request).await;
        link.recycle().await;
        result.map(|line| protocol::parse_catalog(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{LinkOp, MockLink};
    use crate::measurement::{Reading, Unit};
    use crate::protocol::MeasurementKind;
    use tracing_test::traced_test;

    async fn client_with<F>(responder: F) -> (ItcClient, crate::hardware::mock::Journal)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let mock = MockLink::new(responder);
        let journal = mock.journal();
        let link = SharedLink::new(mock);
        link.open().await.unwrap();
        journal.clear();
        (ItcClient::new(link), journal)
    }

    #[tokio::test]
    async fn read_is_followed_by_recycle() {
        let (client, journal) =
            client_with(|_| Some("STAT:DEV:MB1.T1:TEMP:SIG:TEMP:23.4K".into())).await;

        let reply = client
            .read("DEV:MB1.T1:TEMP", Command::Signal(MeasurementKind::Temp))
            .await
            .unwrap();

        assert_eq!(reply, Reply::Value(Value::Reading(Reading::new(23.4, Unit::Kelvin))));
        assert_eq!(
            journal.ops(),
            vec![
                LinkOp::Write("READ:DEV:MB1.T1:TEMP:SIG:TEMP".into()),
                LinkOp::Read,
                LinkOp::Close,
                LinkOp::Open,
            ]
        );
    }

    #[tokio::test]
    async fn failed_read_still_recycles() {
        let (client, journal) = client_with(|_| None).await;
        let result = client.read("DEV:MB0.H1:HTR", Command::VoltageLimit).await;
        assert!(matches!(result, Err(ItcError::Timeout(_))));
        assert_eq!(journal.recycles(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_read_is_logged_with_its_address() {
        let (client, _) = client_with(|_| None).await;
        let _ = client.read("DEV:MB1.T1:TEMP", Command::LoopP).await;
        assert!(logs_contain("read failed"));
        assert!(logs_contain("DEV:MB1.T1:TEMP"));
    }

    #[tokio::test]
    async fn read_value_retries_invalid_until_bound() {
        let (client, journal) = client_with(|_| Some("STAT:DEV:MB0.H1:HTR:VLIM:INVALID".into())).await;
        let result = client.read_value("DEV:MB0.H1:HTR", Command::VoltageLimit, 5).await;
        assert!(matches!(result, Err(ItcError::InvalidResponse(_))));
        assert_eq!(journal.writes().len(), 5);
        assert_eq!(journal.recycles(), 5);
    }

    #[tokio::test]
    async fn read_value_stops_at_first_value() {
        let mut calls = 0;
        let (client, journal) = client_with(move |_| {
            calls += 1;
            Some(if calls < 3 {
                "STAT:DEV:MB0.H1:HTR:VLIM:INVALID".to_string()
            } else {
                "STAT:DEV:MB0.H1:HTR:VLIM:20.0V".to_string()
            })
        })
        .await;

        let value = client.read_value("DEV:MB0.H1:HTR", Command::VoltageLimit, 5).await.unwrap();
        assert_eq!(value.magnitude(), Some(20.0));
        assert_eq!(journal.writes().len(), 3);
    }

    #[tokio::test]
    async fn catalog_and_identify() {
        let (client, _) = client_with(|request| {
            Some(if request == "*IDN?" {
                "IDN:OXFORD INSTRUMENTS:MERCURY ITC:123:2.5".to_string()
            } else {
                "STAT:SYS:CAT:DEV:MB1.T1:TEMP:DEV:MB0.H1:HTR".to_string()
            })
        })
        .await;

        assert!(client.identify().await.unwrap().contains("MERCURY ITC"));
        assert_eq!(
            client.catalog().await.unwrap(),
            vec!["DEV:MB1.T1:TEMP", "DEV:MB0.H1:HTR"]
        );
    }
}
