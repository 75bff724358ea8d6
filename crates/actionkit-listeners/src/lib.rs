//! # actionkit-listeners: observation windows around one execution
//!
//! Every listener shares the shape `listen(work) -> Result<Value>`: it opens
//! a window, runs `work`, and closes the window only if `work` succeeded.
//! A listener whose work failed has no result; asking for one yields
//! [`HarnessError::NotExecuted`](actionkit_protocol::HarnessError::NotExecuted).
//! Errors from `work` are returned untouched.
//!
//! ## Module Overview
//!
//! - [`timing`]: `TimingListener`
//! - [`profile`]: `ProfileListener` and memory checkpoints
//! - [`capture`]: `QueryListener`, `LogListener`
//! - [`feed`]: `QueryFeed`, `LogFeed` and their notifications
//! - [`layer`]: `LogCaptureLayer`, the `tracing` bridge into the log feed
//! - [`probe`]: `MemoryProbe` implementations

pub mod capture;
pub mod feed;
pub mod layer;
pub mod probe;
pub mod profile;
pub mod timing;

use std::fmt;
use std::sync::Arc;

use actionkit_events::{EventBus, EventSource};
use actionkit_protocol::{HarnessResult, LogRecord, Measurement, Profile, QueryRecord};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use capture::{LogListener, QueryListener};
pub use feed::{Feed, LogFeed, LogNotice, QueryExecuted, QueryFeed, Tap, TapGuard};
pub use layer::{LogCaptureLayer, log_level};
pub use probe::{ManualMemoryProbe, MemoryProbe, ProcessMemoryProbe};
pub use profile::ProfileListener;
pub use timing::TimingListener;

/// The four instrumentation features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    Timing,
    Profile,
    Queries,
    Logs,
}

impl ListenerKind {
    /// Name of the harness method that enables this feature.
    pub fn feature(self) -> &'static str {
        match self {
            Self::Timing => "measure",
            Self::Profile => "profile",
            Self::Queries => "queries",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.feature())
    }
}

/// Result of a completed listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerOutput {
    Measurement(Measurement),
    Profile(Profile),
    Queries(Vec<QueryRecord>),
    Logs(Vec<LogRecord>),
}

#[derive(Debug)]
pub enum Listener {
    Timing(TimingListener),
    Profile(ProfileListener),
    Queries(QueryListener),
    Logs(LogListener),
}

impl Listener {
    pub fn kind(&self) -> ListenerKind {
        match self {
            Self::Timing(_) => ListenerKind::Timing,
            Self::Profile(_) => ListenerKind::Profile,
            Self::Queries(_) => ListenerKind::Queries,
            Self::Logs(_) => ListenerKind::Logs,
        }
    }

    pub fn listen<F>(&mut self, work: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        match self {
            Self::Timing(listener) => listener.listen(work),
            Self::Profile(listener) => listener.listen(work),
            Self::Queries(listener) => listener.listen(work),
            Self::Logs(listener) => listener.listen(work),
        }
    }

    pub fn result(&self) -> HarnessResult<ListenerOutput> {
        Ok(match self {
            Self::Timing(listener) => ListenerOutput::Measurement(listener.result()?),
            Self::Profile(listener) => ListenerOutput::Profile(listener.result()?),
            Self::Queries(listener) => ListenerOutput::Queries(listener.result()?),
            Self::Logs(listener) => ListenerOutput::Logs(listener.result()?),
        })
    }
}

/// The collaborators listeners tap: bus, memory probe and both feeds.
#[derive(Clone)]
pub struct Instruments {
    pub bus: Arc<EventBus>,
    pub probe: Arc<dyn MemoryProbe>,
    pub queries: Arc<QueryFeed>,
    pub logs: Arc<LogFeed>,
}

impl fmt::Debug for Instruments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruments")
            .field("bus", &self.bus)
            .field("queries", &self.queries)
            .field("logs", &self.logs)
            .finish_non_exhaustive()
    }
}

impl Instruments {
    pub fn new(bus: Arc<EventBus>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            bus,
            probe,
            queries: Arc::new(QueryFeed::new()),
            logs: Arc::new(LogFeed::new()),
        }
    }

    /// Build a listener of `kind` for `subject`. `event_source` is the
    /// instance standing in front of the subject, or the subject itself.
    pub fn create_listener(
        &self,
        kind: ListenerKind,
        subject: &EventSource,
        event_source: &EventSource,
    ) -> Listener {
        match kind {
            ListenerKind::Timing => Listener::Timing(TimingListener::new(subject.action.clone())),
            ListenerKind::Profile => Listener::Profile(ProfileListener::new(
                subject,
                event_source,
                Arc::clone(&self.bus),
                Arc::clone(&self.probe),
            )),
            ListenerKind::Queries => Listener::Queries(QueryListener::new(
                subject.action.clone(),
                Arc::clone(&self.queries),
            )),
            ListenerKind::Logs => Listener::Logs(LogListener::new(
                subject.action.clone(),
                Arc::clone(&self.logs),
            )),
        }
    }
}
