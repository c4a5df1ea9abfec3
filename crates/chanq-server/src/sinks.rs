//! Built-in handlers used by the server binary.

use std::io::Write;

use async_trait::async_trait;
use parking_lot::Mutex;

use chanq_proto::ChangeRecord;

use crate::consumer::NotificationHandler;
use crate::error::HandlerError;

/// Logs every record at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationHandler for LogSink {
    async fn handle(&self, record: &ChangeRecord) -> Result<(), HandlerError> {
        tracing::info!(
            entity_type = %record.entity_type,
            primary_key = %record.primary_key,
            operation = %record.operation,
            timestamp = record.timestamp,
            "change notification"
        );
        Ok(())
    }
}

/// Writes every record as one JSON document per line.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    /// Sink writing to standard output.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

#[async_trait]
impl<W: Write + Send> NotificationHandler for JsonLinesSink<W> {
    async fn handle(&self, record: &ChangeRecord) -> Result<(), HandlerError> {
        let line = serde_json::to_string(record).map_err(|e| HandlerError::new(e.to_string()))?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}
