use std::sync::Arc;

use actionkit_listeners::ListenerOutput;
use actionkit_protocol::{LogRecord, Measurement, Profile, QueryRecord};
use parking_lot::Mutex;

/// Per-feature result buffers of one harness invocation, in completion
/// order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBuffers {
    pub measurements: Vec<Measurement>,
    pub profiles: Vec<Profile>,
    pub queries: Vec<QueryRecord>,
    pub logs: Vec<LogRecord>,
}

impl ResultBuffers {
    pub fn add(&mut self, output: ListenerOutput) {
        match output {
            ListenerOutput::Measurement(measurement) => self.measurements.push(measurement),
            ListenerOutput::Profile(profile) => self.profiles.push(profile),
            ListenerOutput::Queries(queries) => self.queries.extend(queries),
            ListenerOutput::Logs(logs) => self.logs.extend(logs),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
            && self.profiles.is_empty()
            && self.queries.is_empty()
            && self.logs.is_empty()
    }
}

/// Shared handle proxies report into.
#[derive(Debug, Clone, Default)]
pub struct ResultSink {
    buffers: Arc<Mutex<ResultBuffers>>,
}

impl ResultSink {
    pub fn add(&self, output: ListenerOutput) {
        self.buffers.lock().add(output);
    }

    /// Move the collected results out, leaving empty buffers behind.
    pub fn take(&self) -> ResultBuffers {
        std::mem::take(&mut *self.buffers.lock())
    }

    pub fn reset(&self) {
        *self.buffers.lock() = ResultBuffers::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionkit_protocol::{ActionType, LogLevel};
    use chrono::Utc;
    use serde_json::Map;

    fn log(message: &str) -> LogRecord {
        LogRecord {
            level: LogLevel::Info,
            message: message.to_owned(),
            context: Map::new(),
            timestamp: Utc::now(),
            channel: "app".to_owned(),
            action: Some(ActionType::new("Root")),
        }
    }

    #[test]
    fn outputs_are_appended_per_feature() {
        let sink = ResultSink::default();
        sink.add(ListenerOutput::Logs(vec![log("one"), log("two")]));
        sink.add(ListenerOutput::Logs(vec![]));
        sink.add(ListenerOutput::Logs(vec![log("three")]));

        let buffers = sink.take();
        let messages: Vec<&str> = buffers.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["one", "two", "three"]);
        assert!(buffers.measurements.is_empty());
        assert!(sink.take().is_empty());
    }
}
