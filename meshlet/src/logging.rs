//! Log redirection over the control channel.
//!
//! Every log line becomes a [`LogRecord`], serialized to a JSON string and
//! shipped as a detached `log` command; the writer never awaits the parent's
//! acknowledgment. Producers are the [`ControlTracingLayer`] (structured
//! `tracing` events) and the standard-stream capture in `fd_redirect`; both
//! hand records to one forwarder task through an unbounded channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::endpoint::ControlEndpoint;
use crate::config::LoggerOptions;

/// Structured record shipped to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    /// Epoch milliseconds.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl LogRecord {
    pub fn new(level: &str, name: Option<String>, msg: impl Into<String>) -> Self {
        Self {
            level: level.to_string(),
            time: chrono::Utc::now().timestamp_millis(),
            name,
            msg: msg.into(),
            target: None,
        }
    }
}

/// Forwards records to the parent as detached `log` commands. Stops when the
/// producers drop their senders or the channel closes underneath it.
pub fn spawn_log_forwarder(
    endpoint: ControlEndpoint,
    mut records: mpsc::UnboundedReceiver<LogRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            let Ok(line) = serde_json::to_string(&record) else {
                continue;
            };
            if endpoint.send_detached("log", Value::String(line)).is_err() {
                break;
            }
        }
    })
}

/// Tracing layer that redirects the worker's structured logging to the
/// parent.
///
/// Events from the bridge modules are skipped: a log record becomes a frame,
/// and a frame-layer event about that frame would become another record.
pub struct ControlTracingLayer {
    tx: mpsc::UnboundedSender<LogRecord>,
    level: Level,
    name: Option<String>,
}

impl ControlTracingLayer {
    pub fn new(tx: mpsc::UnboundedSender<LogRecord>, options: &LoggerOptions) -> Self {
        Self {
            tx,
            level: options.level,
            name: options.name.clone(),
        }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for ControlTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();

        if target.starts_with("meshlet::bridge") {
            return;
        }
        if *metadata.level() > self.level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(
            Self::level_to_string(metadata.level()),
            self.name.clone(),
            visitor.message,
        );
        record.target = Some(target.to_string());

        let _ = self.tx.send(record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
