//! Single-consumer log funnel
//!
//! Workers never write to the reporting sink directly. They send
//! [`LogRecord`]s through a cloneable [`LogHandle`]; one task drains the
//! channel and forwards records to a [`LogSink`] in arrival order, so
//! multi-line messages from concurrent workers never interleave.
//!
//! [`LogAggregator::finish`] sends an end-of-stream marker and waits for the
//! consumer, which guarantees every record sent before the call has reached the
//! sink.

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Severity of a forwarded record
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Normal progress
    Info,
    /// Something went wrong but the run continues
    Warn,
    /// A task failed
    Error,
}

/// One message from a producer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity
    pub level: LogLevel,
    /// Producer name (e.g. "worker-2", "scheduler")
    pub source: String,
    /// Message text, possibly spanning several lines
    pub message: String,
}

#[derive(Debug)]
enum LogEvent {
    Record(LogRecord),
    EndOfStream,
}

/// Cloneable producer side of the aggregator
#[derive(Clone, Debug)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<LogEvent>,
    source: String,
}

impl LogHandle {
    /// A handle that tags its records with a different source
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            source: source.into(),
        }
    }

    /// Source name attached to records from this handle
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Send a record; silently dropped once the aggregator has finished
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.tx
            .send(LogEvent::Record(LogRecord {
                level,
                source: self.source.clone(),
                message: message.into(),
            }))
            .ok();
    }

    /// Send a debug record
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Send an info record
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Send a warning record
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    /// Send an error record
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

/// Destination for aggregated records
pub trait LogSink: Send + 'static {
    /// Forward one record
    fn emit(&mut self, record: &LogRecord);

    /// Called once after the end-of-stream marker
    fn flush(&mut self) {}
}

/// Re-emits records as `tracing` events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&mut self, record: &LogRecord) {
        let source = record.source.as_str();
        match record.level {
            LogLevel::Debug => tracing::debug!(source, "{}", record.message),
            LogLevel::Info => tracing::info!(source, "{}", record.message),
            LogLevel::Warn => tracing::warn!(source, "{}", record.message),
            LogLevel::Error => tracing::error!(source, "{}", record.message),
        }
    }
}

/// Keeps every record in memory; clones share the same buffer
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the records received so far
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Messages received so far that contain `needle`
    pub fn matching(&self, needle: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message.contains(needle))
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&mut self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Owner of the consumer task
#[derive(Debug)]
pub struct LogAggregator<S> {
    tx: mpsc::UnboundedSender<LogEvent>,
    consumer: JoinHandle<S>,
}

impl<S: LogSink> LogAggregator<S> {
    /// Start the consumer and return a producer handle tagged "main"
    pub fn spawn(sink: S) -> (LogHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(consume(rx, sink));
        let handle = LogHandle {
            tx: tx.clone(),
            source: "main".to_string(),
        };
        (handle, Self { tx, consumer })
    }

    /// Send end-of-stream, wait for the consumer to drain and return the sink
    pub async fn finish(self) -> Result<S> {
        self.tx.send(LogEvent::EndOfStream).ok();
        self.consumer
            .await
            .map_err(|e| Error::Other(format!("log aggregator task failed: {e}")))
    }
}

async fn consume<S: LogSink>(mut rx: mpsc::UnboundedReceiver<LogEvent>, mut sink: S) -> S {
    while let Some(event) = rx.recv().await {
        match event {
            LogEvent::Record(record) => sink.emit(&record),
            LogEvent::EndOfStream => break,
        }
    }
    sink.flush();
    sink
}
