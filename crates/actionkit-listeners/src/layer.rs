//! Bridges `tracing` events into the [`LogFeed`].

use std::fmt;
use std::sync::Arc;

use actionkit_protocol::LogLevel;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::feed::{LogFeed, LogNotice};

/// Targets whose events are harness bookkeeping, not action output.
const INTERNAL_TARGETS: [&str; 5] = [
    "actionkit_events",
    "actionkit_container",
    "actionkit_listeners",
    "actionkit_runtime",
    "actionkit_kernel",
];

pub fn log_level(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warning,
        Level::INFO => LogLevel::Info,
        Level::DEBUG | Level::TRACE => LogLevel::Debug,
    }
}

/// `tracing_subscriber` layer forwarding every event to a [`LogFeed`]. The
/// event target becomes the channel; fields other than `message` become the
/// context.
#[derive(Debug, Clone)]
pub struct LogCaptureLayer {
    feed: Arc<LogFeed>,
}

impl LogCaptureLayer {
    pub fn new(feed: Arc<LogFeed>) -> Self {
        Self { feed }
    }
}

impl<S: Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if INTERNAL_TARGETS
            .iter()
            .any(|internal| target.starts_with(internal))
        {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        self.feed.notify(&LogNotice {
            level: log_level(metadata.level()),
            message: fields.message,
            context: fields.context,
            timestamp: Utc::now(),
            channel: target.to_owned(),
        });
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    context: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.context.insert(field.name().to_owned(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }
}
