//! Push/pull log-record relay.
//!
//! Ships log records from distributed workers back to a central consumer: a
//! [`RelaySender`] connects to a `tcp://host:port` address and pushes
//! serialized records, and a [`RelayConsumer`] binds the same address, polls
//! for records and re-emits each one through a local [`RecordSink`]. The
//! consumer exposes readiness and shutdown signals so an embedding process
//! can wait for the socket to be bound before producers start sending, and
//! can stop the loop cleanly once producers are done.
//!
//! A failure to receive or dispatch one record is logged locally and the
//! relay keeps processing subsequent records.

use crate::errors::{DagflowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Severity of a relayed log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level detail.
    Trace,
    /// Debug-level detail.
    Debug,
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

/// One log record shipped over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Record severity.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Originating component.
    pub target: String,
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Creates a record stamped now, targeting `dagflow`.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            target: "dagflow".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Sets the originating component.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

/// Local destination for records the consumer pulls off the wire.
pub trait RecordSink: Send + Sync {
    /// Handles one received record.
    fn receive(&self, record: &LogRecord);
}

/// Default sink: re-emits each record through `tracing` at its level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecordSink;

impl RecordSink for TracingRecordSink {
    fn receive(&self, record: &LogRecord) {
        match record.level {
            LogLevel::Trace => {
                tracing::trace!(origin = %record.target, "{}", record.message);
            }
            LogLevel::Debug => {
                tracing::debug!(origin = %record.target, "{}", record.message);
            }
            LogLevel::Info => {
                tracing::info!(origin = %record.target, "{}", record.message);
            }
            LogLevel::Warning => {
                tracing::warn!(origin = %record.target, "{}", record.message);
            }
            LogLevel::Error => {
                tracing::error!(origin = %record.target, "{}", record.message);
            }
        }
    }
}

/// A sink that collects records in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct CollectingRecordSink {
    records: parking_lot::Mutex<Vec<LogRecord>>,
}

impl CollectingRecordSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records received so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Number of records received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records have been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RecordSink for CollectingRecordSink {
    fn receive(&self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Strips the `tcp://` scheme off a relay address.
fn parse_address(address: &str) -> Result<&str> {
    address
        .strip_prefix("tcp://")
        .ok_or_else(|| DagflowError::Relay(format!("expected tcp://host:port, got '{address}'")))
}

/// Push side of the relay: connects to a consumer and ships records.
#[derive(Debug)]
pub struct RelaySender {
    stream: TcpStream,
}

impl RelaySender {
    /// Connects to a consumer at a `tcp://host:port` address.
    ///
    /// # Errors
    ///
    /// Fails when the address is malformed or the connection is refused.
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(parse_address(address)?).await?;
        Ok(Self { stream })
    }

    /// Ships one record, serialized as a JSON line.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be serialized or the connection is gone.
    pub async fn send(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        Ok(())
    }
}

/// Pull side of the relay: binds an address and re-emits received records.
#[derive(Debug)]
pub struct RelayConsumer {
    local_addr: SocketAddr,
    ready: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayConsumer {
    /// Default polling interval for the shutdown check.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

    /// Binds the consumer with the default interval and tracing sink.
    ///
    /// # Errors
    ///
    /// Fails when the address is malformed or cannot be bound.
    pub async fn bind(address: &str) -> Result<Self> {
        Self::bind_with(address, Self::DEFAULT_POLL_INTERVAL, Arc::new(TracingRecordSink)).await
    }

    /// Binds the consumer with an explicit poll interval and sink.
    ///
    /// # Errors
    ///
    /// Fails when the address is malformed or cannot be bound.
    pub async fn bind_with(
        address: &str,
        poll_interval: Duration,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(parse_address(address)?).await?;
        let local_addr = listener.local_addr()?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(consumer_loop(listener, sink, ready_tx, shutdown_rx, poll_interval));

        Ok(Self {
            local_addr,
            ready: ready_rx,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// The bound socket address; useful when binding port 0.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until the socket loop is receiving. Producers should not send
    /// before this resolves.
    pub async fn ready(&mut self) {
        while !*self.ready.borrow() {
            if self.ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Requests a clean shutdown of the socket loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for the socket loop to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DagflowError::Join`] when the loop task was lost.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|err| DagflowError::Join(err.to_string()))
    }
}

async fn consumer_loop(
    listener: TcpListener,
    sink: Arc<dyn RecordSink>,
    ready: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    let _ = ready.send(true);
    let mut poll = tokio::time::interval(poll_interval);
    let mut readers = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "relay producer connected");
                    readers.push(tokio::spawn(read_records(
                        stream,
                        Arc::clone(&sink),
                        shutdown.clone(),
                    )));
                }
                Err(err) => {
                    tracing::error!(error = %err, "relay accept failed");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = poll.tick() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    for reader in readers {
        let _ = reader.await;
    }
}

async fn read_records(
    stream: TcpStream,
    sink: Arc<dyn RecordSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<LogRecord>(&line) {
                    Ok(record) => sink.receive(&record),
                    // One bad record never stops the relay.
                    Err(err) => {
                        tracing::error!(error = %err, "failed to decode relay record");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, "relay receive failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn wait_for_records(sink: &CollectingRecordSink, count: usize) {
        // Bounded polling window.
        for _ in 0..200 {
            if sink.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} records, got {}", sink.len());
    }

    #[tokio::test]
    async fn test_relay_preserves_level_and_message() {
        let sink = Arc::new(CollectingRecordSink::new());
        let mut consumer = RelayConsumer::bind_with(
            "tcp://127.0.0.1:0",
            Duration::from_millis(50),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
        )
        .await
        .unwrap();
        consumer.ready().await;

        let address = format!("tcp://{}", consumer.local_addr());
        let mut sender = RelaySender::connect(&address).await.unwrap();
        sender
            .send(&LogRecord::new(LogLevel::Info, "info"))
            .await
            .unwrap();
        sender
            .send(&LogRecord::new(LogLevel::Warning, "warning"))
            .await
            .unwrap();
        sender
            .send(&LogRecord::new(LogLevel::Error, "error"))
            .await
            .unwrap();
        drop(sender);

        wait_for_records(&sink, 3).await;
        consumer.shutdown();
        consumer.join().await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records
                .iter()
                .map(|r| (r.level, r.message.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (LogLevel::Info, "info"),
                (LogLevel::Warning, "warning"),
                (LogLevel::Error, "error"),
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_record_does_not_stop_the_relay() {
        let sink = Arc::new(CollectingRecordSink::new());
        let mut consumer = RelayConsumer::bind_with(
            "tcp://127.0.0.1:0",
            Duration::from_millis(50),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
        )
        .await
        .unwrap();
        consumer.ready().await;

        let address = consumer.local_addr();
        let mut raw = TcpStream::connect(address).await.unwrap();
        raw.write_all(b"not json at all\n").await.unwrap();
        let good = serde_json::to_vec(&LogRecord::new(LogLevel::Info, "still here")).unwrap();
        raw.write_all(&good).await.unwrap();
        raw.write_all(b"\n").await.unwrap();
        drop(raw);

        wait_for_records(&sink, 1).await;
        consumer.shutdown();
        consumer.join().await.unwrap();

        assert_eq!(sink.records()[0].message, "still here");
    }

    #[test]
    fn test_address_must_be_tcp() {
        assert!(parse_address("ipc:///tmp/sock").is_err());
        assert_eq!(parse_address("tcp://127.0.0.1:9777").unwrap(), "127.0.0.1:9777");
    }

    #[test]
    fn test_record_roundtrip() {
        let record = LogRecord::new(LogLevel::Warning, "careful").with_target("worker-3");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"warning\""));

        let back: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
