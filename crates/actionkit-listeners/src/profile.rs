use std::fmt;
use std::sync::Arc;

use actionkit_events::{EventBus, EventSource, RECORD_MEMORY_EVENT, SubscriptionId};
use actionkit_protocol::{ActionType, HarnessError, HarnessResult, MemoryCheckpoint, Profile};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::probe::MemoryProbe;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    memory: u64,
}

/// Timing plus memory usage around one execution, with labelled checkpoints.
///
/// Checkpoints arrive through the reserved record-memory event of the
/// subject and, when it differs, of the event source standing in front of
/// it. Both subscriptions end when the listener drops.
pub struct ProfileListener {
    subject: ActionType,
    probe: Arc<dyn MemoryProbe>,
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
    checkpoints: Arc<Mutex<Vec<MemoryCheckpoint>>>,
    start: Option<Sample>,
    end: Option<(Sample, u64)>,
}

impl fmt::Debug for ProfileListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileListener")
            .field("subject", &self.subject)
            .field("subscriptions", &self.subscriptions)
            .field("checkpoints", &self.checkpoints.lock().len())
            .finish_non_exhaustive()
    }
}

impl ProfileListener {
    pub fn new(
        subject: &EventSource,
        event_source: &EventSource,
        bus: Arc<EventBus>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let checkpoints = Arc::new(Mutex::new(Vec::new()));

        let mut sources = vec![subject];
        if event_source.identity != subject.identity {
            sources.push(event_source);
        }
        let subscriptions = sources
            .into_iter()
            .map(|source| {
                let sink = Arc::clone(&checkpoints);
                let probe = Arc::clone(&probe);
                bus.subscribe(
                    source.key(RECORD_MEMORY_EVENT),
                    Arc::new(move |data: &Value| {
                        sink.lock().push(checkpoint(probe.as_ref(), data));
                    }),
                )
            })
            .collect();

        Self {
            subject: subject.action.clone(),
            probe,
            bus,
            subscriptions,
            checkpoints,
            start: None,
            end: None,
        }
    }

    pub fn listen<F>(&mut self, work: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        self.start = Some(Sample {
            at: Utc::now(),
            memory: self.probe.current_usage(),
        });
        let value = work()?;
        let end = Sample {
            at: Utc::now(),
            memory: self.probe.current_usage(),
        };
        self.end = Some((end, self.probe.peak_usage()));
        Ok(value)
    }

    /// Append a checkpoint with the current usage.
    pub fn record_memory(&self, label: &str) {
        self.checkpoints
            .lock()
            .push(checkpoint(self.probe.as_ref(), &Value::from(label)));
    }

    pub fn checkpoints(&self) -> Vec<MemoryCheckpoint> {
        self.checkpoints.lock().clone()
    }

    pub fn result(&self) -> HarnessResult<Profile> {
        match (self.start, self.end) {
            (Some(start), Some((end, peak))) => Ok(Profile {
                subject: self.subject.clone(),
                start: start.at,
                end: end.at,
                start_memory: start.memory,
                end_memory: end.memory,
                peak_memory: peak,
                checkpoints: self.checkpoints(),
            }),
            _ => Err(HarnessError::NotExecuted(self.subject.clone())),
        }
    }
}

impl Drop for ProfileListener {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
        debug!(subject = %self.subject, "profile listener released");
    }
}

fn checkpoint(probe: &dyn MemoryProbe, data: &Value) -> MemoryCheckpoint {
    let label = match data {
        Value::String(label) => label.clone(),
        other => other.to_string(),
    };
    MemoryCheckpoint {
        label,
        memory: probe.current_usage(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ManualMemoryProbe;
    use actionkit_protocol::Identity;

    fn source(name: &str) -> EventSource {
        EventSource::new(ActionType::new(name), Identity::new())
    }

    #[test]
    fn samples_memory_around_work() -> Result<()> {
        let bus = Arc::new(EventBus::new());
        let probe = Arc::new(ManualMemoryProbe::new(1000));
        let subject = source("Import");
        let mut listener = ProfileListener::new(
            &subject,
            &subject,
            Arc::clone(&bus),
            Arc::clone(&probe) as Arc<dyn MemoryProbe>,
        );

        let work_probe = Arc::clone(&probe);
        listener.listen(|| {
            work_probe.allocate(5000);
            work_probe.release(2000);
            Ok(Value::Null)
        })?;

        let profile = listener.result()?;
        assert_eq!(profile.start_memory, 1000);
        assert_eq!(profile.end_memory, 4000);
        assert_eq!(profile.peak_memory, 6000);
        assert_eq!(profile.memory_used(), 3000);
        Ok(())
    }

    #[test]
    fn checkpoints_arrive_from_subject_and_event_source() -> Result<()> {
        let bus = Arc::new(EventBus::new());
        let probe = Arc::new(ManualMemoryProbe::new(0));
        let subject = source("Import");
        let proxy = EventSource::new(subject.action.clone(), Identity::new());
        let mut listener = ProfileListener::new(
            &subject,
            &proxy,
            Arc::clone(&bus),
            Arc::clone(&probe) as Arc<dyn MemoryProbe>,
        );

        let work_bus = Arc::clone(&bus);
        let work_probe = Arc::clone(&probe);
        listener.listen(|| {
            work_probe.set(128);
            work_bus.publish(&subject.key(RECORD_MEMORY_EVENT), &Value::from("loaded"));
            work_probe.set(256);
            work_bus.publish(&proxy.key(RECORD_MEMORY_EVENT), &Value::from("parsed"));
            Ok(Value::Null)
        })?;
        listener.record_memory("done");

        let labels: Vec<(String, u64)> = listener
            .result()?
            .checkpoints
            .into_iter()
            .map(|c| (c.label, c.memory))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("loaded".to_owned(), 128),
                ("parsed".to_owned(), 256),
                ("done".to_owned(), 256),
            ]
        );
        Ok(())
    }

    #[test]
    fn dropping_listener_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let subject = source("Import");
        let listener = ProfileListener::new(
            &subject,
            &subject,
            Arc::clone(&bus),
            Arc::new(ManualMemoryProbe::default()),
        );
        let key = subject.key(RECORD_MEMORY_EVENT);
        assert_eq!(bus.subscriber_count(&key), 1);
        drop(listener);
        assert_eq!(bus.subscriber_count(&key), 0);
    }

    #[test]
    fn failed_work_has_no_profile() {
        let bus = Arc::new(EventBus::new());
        let subject = source("Import");
        let mut listener = ProfileListener::new(
            &subject,
            &subject,
            bus,
            Arc::new(ManualMemoryProbe::default()),
        );
        assert!(listener.listen(|| anyhow::bail!("oom")).is_err());
        assert!(matches!(
            listener.result(),
            Err(HarnessError::NotExecuted(_))
        ));
    }
}
