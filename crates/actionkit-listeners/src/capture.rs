//! Query and log capture. Both attach to their feed only while `work` runs
//! and detach on every exit path.

use std::collections::BTreeMap;
use std::sync::Arc;

use actionkit_protocol::{
    ActionType, HarnessError, HarnessResult, LogLevel, LogRecord, QueryRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;

use crate::feed::{LogFeed, LogNotice, QueryExecuted, QueryFeed};

#[derive(Debug)]
pub struct QueryListener {
    subject: ActionType,
    feed: Arc<QueryFeed>,
    records: Arc<Mutex<Vec<QueryRecord>>>,
    completed: bool,
}

impl QueryListener {
    pub fn new(subject: ActionType, feed: Arc<QueryFeed>) -> Self {
        Self {
            subject,
            feed,
            records: Arc::new(Mutex::new(Vec::new())),
            completed: false,
        }
    }

    pub fn listen<F>(&mut self, work: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        let sink = Arc::clone(&self.records);
        let action = self.subject.clone();
        let _tap = self.feed.attach(Arc::new(move |query: &QueryExecuted| {
            sink.lock().push(QueryRecord {
                sql: query.sql.clone(),
                bindings: query.bindings.clone(),
                duration_ms: query.duration_ms,
                connection: query.connection.clone(),
                action: Some(action.clone()),
            });
        }));
        let value = work()?;
        self.completed = true;
        Ok(value)
    }

    /// Records captured so far, completed or not.
    pub fn records(&self) -> Vec<QueryRecord> {
        self.records.lock().clone()
    }

    pub fn result(&self) -> HarnessResult<Vec<QueryRecord>> {
        if !self.completed {
            return Err(HarnessError::NotExecuted(self.subject.clone()));
        }
        Ok(self.records())
    }

    pub fn call_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn total_duration_ms(&self) -> f64 {
        self.records.lock().iter().map(|q| q.duration_ms).sum()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[derive(Debug)]
pub struct LogListener {
    subject: ActionType,
    feed: Arc<LogFeed>,
    records: Arc<Mutex<Vec<LogRecord>>>,
    completed: bool,
}

impl LogListener {
    pub fn new(subject: ActionType, feed: Arc<LogFeed>) -> Self {
        Self {
            subject,
            feed,
            records: Arc::new(Mutex::new(Vec::new())),
            completed: false,
        }
    }

    pub fn listen<F>(&mut self, work: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        let sink = Arc::clone(&self.records);
        let action = self.subject.clone();
        let _tap = self.feed.attach(Arc::new(move |notice: &LogNotice| {
            sink.lock().push(LogRecord {
                level: notice.level,
                message: notice.message.clone(),
                context: notice.context.clone(),
                timestamp: notice.timestamp,
                channel: notice.channel.clone(),
                action: Some(action.clone()),
            });
        }));
        let value = work()?;
        self.completed = true;
        Ok(value)
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn result(&self) -> HarnessResult<Vec<LogRecord>> {
        if !self.completed {
            return Err(HarnessError::NotExecuted(self.subject.clone()));
        }
        Ok(self.records())
    }

    pub fn log_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn logs_by_level(&self) -> BTreeMap<LogLevel, Vec<LogRecord>> {
        let mut grouped: BTreeMap<LogLevel, Vec<LogRecord>> = BTreeMap::new();
        for record in self.records.lock().iter() {
            grouped.entry(record.level).or_default().push(record.clone());
        }
        grouped
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[test]
    fn query_round_trip_preserves_order_and_duration() -> Result<()> {
        let feed = Arc::new(QueryFeed::new());
        let mut listener = QueryListener::new(ActionType::new("LoadUser"), Arc::clone(&feed));

        let work_feed = Arc::clone(&feed);
        listener.listen(|| {
            for (i, ms) in [0.25, 12.5, 3.0].into_iter().enumerate() {
                work_feed.notify(&QueryExecuted::new(
                    format!("select {i}"),
                    vec![json!(i)],
                    ms,
                ));
            }
            Ok(Value::Null)
        })?;

        let records = listener.result()?;
        assert_eq!(records.len(), 3);
        let sql: Vec<&str> = records.iter().map(|r| r.sql.as_str()).collect();
        assert_eq!(sql, ["select 0", "select 1", "select 2"]);
        let ms: Vec<f64> = records.iter().map(|r| r.duration_ms).collect();
        assert_eq!(ms, [0.25, 12.5, 3.0]);
        assert!(
            records
                .iter()
                .all(|r| r.action.as_ref().map(ActionType::as_str) == Some("LoadUser"))
        );
        assert_eq!(listener.call_count(), 3);
        assert_eq!(listener.total_duration_ms(), 15.75);
        Ok(())
    }

    #[test]
    fn queries_outside_the_window_are_ignored() -> Result<()> {
        let feed = Arc::new(QueryFeed::new());
        let mut listener = QueryListener::new(ActionType::new("LoadUser"), Arc::clone(&feed));
        feed.notify(&QueryExecuted::new("before", vec![], 1.0));
        listener.listen(|| Ok(Value::Null))?;
        feed.notify(&QueryExecuted::new("after", vec![], 1.0));

        assert!(listener.result()?.is_empty());
        assert_eq!(feed.tap_count(), 0);
        Ok(())
    }

    #[test]
    fn query_tap_detaches_when_work_fails() {
        let feed = Arc::new(QueryFeed::new());
        let mut listener = QueryListener::new(ActionType::new("LoadUser"), Arc::clone(&feed));
        let work_feed = Arc::clone(&feed);
        let err = listener
            .listen(|| {
                work_feed.notify(&QueryExecuted::new("select 1", vec![], 2.0));
                Err(anyhow!("deadlock"))
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "deadlock");
        assert_eq!(feed.tap_count(), 0);
        assert_eq!(listener.records().len(), 1);
        assert!(matches!(listener.result(), Err(HarnessError::NotExecuted(_))));
    }

    #[test]
    fn clear_drops_buffered_queries() -> Result<()> {
        let feed = Arc::new(QueryFeed::new());
        let mut listener = QueryListener::new(ActionType::new("LoadUser"), Arc::clone(&feed));
        let work_feed = Arc::clone(&feed);
        listener.listen(|| {
            work_feed.notify(&QueryExecuted::new("select 1", vec![], 2.0));
            Ok(Value::Null)
        })?;
        listener.clear();
        assert_eq!(listener.call_count(), 0);
        Ok(())
    }

    #[test]
    fn logs_are_grouped_by_level() -> Result<()> {
        let feed = Arc::new(LogFeed::new());
        let mut listener = LogListener::new(ActionType::new("SendReceipt"), Arc::clone(&feed));
        let work_feed = Arc::clone(&feed);
        listener.listen(|| {
            work_feed.notify(&LogNotice::new(LogLevel::Info, "queued"));
            work_feed.notify(&LogNotice::new(LogLevel::Error, "smtp down").on_channel("mail"));
            work_feed.notify(&LogNotice::new(LogLevel::Info, "retrying"));
            Ok(Value::Null)
        })?;

        assert_eq!(listener.log_count(), 3);
        let grouped = listener.logs_by_level();
        assert_eq!(grouped[&LogLevel::Info].len(), 2);
        assert_eq!(grouped[&LogLevel::Error][0].channel, "mail");
        let records = listener.result()?;
        assert_eq!(records[0].message, "queued");
        assert_eq!(
            records[0].action.as_ref().map(ActionType::as_str),
            Some("SendReceipt")
        );
        Ok(())
    }
}
