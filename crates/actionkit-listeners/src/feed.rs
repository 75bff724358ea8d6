//! Notification feeds the host calls into: one per executed query, one per
//! log statement. Listeners attach a tap for the length of their window.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use actionkit_protocol::LogLevel;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Tap<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Feed<T> {
    taps: Mutex<Vec<(u64, Tap<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            taps: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("taps", &self.taps.lock().len())
            .finish()
    }
}

impl<T> Feed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `tap` until the returned guard drops.
    pub fn attach(self: &Arc<Self>, tap: Tap<T>) -> TapGuard<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.taps.lock().push((id, tap));
        TapGuard {
            feed: Arc::downgrade(self),
            id,
        }
    }

    /// Deliver `item` to every attached tap, in attach order.
    pub fn notify(&self, item: &T) {
        let taps: Vec<Tap<T>> = self
            .taps
            .lock()
            .iter()
            .map(|(_, tap)| Arc::clone(tap))
            .collect();
        for tap in taps {
            tap(item);
        }
    }

    pub fn tap_count(&self) -> usize {
        self.taps.lock().len()
    }

    fn detach(&self, id: u64) {
        let removed = {
            let mut taps = self.taps.lock();
            taps.iter()
                .position(|(tap_id, _)| *tap_id == id)
                .map(|pos| taps.remove(pos))
        };
        drop(removed);
    }
}

#[must_use = "the tap is detached as soon as the guard is dropped"]
pub struct TapGuard<T> {
    feed: Weak<Feed<T>>,
    id: u64,
}

impl<T> Drop for TapGuard<T> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.detach(self.id);
        }
    }
}

/// One executed query, as reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecuted {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub duration_ms: f64,
    pub connection: String,
}

impl QueryExecuted {
    pub fn new(sql: impl Into<String>, bindings: Vec<Value>, duration_ms: f64) -> Self {
        Self {
            sql: sql.into(),
            bindings,
            duration_ms,
            connection: "default".to_owned(),
        }
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }
}

/// One log statement, as reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogNotice {
    pub level: LogLevel,
    pub message: String,
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
}

impl LogNotice {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            context: Map::new(),
            timestamp: Utc::now(),
            channel: "default".to_owned(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

pub type QueryFeed = Feed<QueryExecuted>;
pub type LogFeed = Feed<LogNotice>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn taps_receive_only_while_attached() {
        let feed = Arc::new(QueryFeed::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        feed.notify(&QueryExecuted::new("select 0", vec![], 1.0));
        {
            let sink = Arc::clone(&seen);
            let _guard = feed.attach(Arc::new(move |q: &QueryExecuted| {
                sink.lock().push(q.sql.clone());
            }));
            assert_eq!(feed.tap_count(), 1);
            feed.notify(&QueryExecuted::new("select 1", vec![json!(1)], 1.0));
        }
        feed.notify(&QueryExecuted::new("select 2", vec![], 1.0));

        assert_eq!(*seen.lock(), vec!["select 1".to_owned()]);
        assert_eq!(feed.tap_count(), 0);
    }

    #[test]
    fn guard_outliving_feed_is_harmless() {
        let feed = Arc::new(LogFeed::new());
        let guard = feed.attach(Arc::new(|_: &LogNotice| {}));
        drop(feed);
        drop(guard);
    }
}
