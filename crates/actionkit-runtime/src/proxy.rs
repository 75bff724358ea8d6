//! Proxy types standing in front of resolved actions. A proxy holds its
//! delegate by composition, runs it inside one listener and reports the
//! listener's result to the harness that created it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use actionkit_container::{Action, ActionInstance, ActionRef, CallContext, Container};
use actionkit_events::{EventBus, EventSource};
use actionkit_listeners::{Instruments, Listener, ListenerKind, ListenerOutput};
use actionkit_protocol::{ActionType, HarnessId, HarnessResult, Identity};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::HarnessConfig;
use crate::sink::ResultSink;

/// Synthesized type standing in for `subject` within one harness.
#[derive(Debug)]
pub struct ProxyType {
    name: String,
    subject: ActionType,
    harness: HarnessId,
}

impl ProxyType {
    fn new(subject: ActionType, harness: HarnessId, config: &HarnessConfig) -> Self {
        let digest = sha256_bytes(format!("{subject}{harness}").as_bytes());
        Self {
            name: format!("{}{digest}", config.proxy_prefix),
            subject,
            harness,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &ActionType {
        &self.subject
    }

    pub fn harness(&self) -> &HarnessId {
        &self.harness
    }

    /// Wrap `delegate` in a new proxy instance. The proxy takes the
    /// delegate's type and capability declaration; the subject is never
    /// constructed here.
    pub fn instantiate(
        &self,
        bus: &Arc<EventBus>,
        delegate: ActionRef,
        configuration: ProxyConfiguration,
    ) -> ActionRef {
        let identity = Identity::new();
        let body = Arc::new(Proxy {
            event_source: EventSource::new(delegate.action_type().clone(), identity.clone()),
            delegate: Arc::clone(&delegate),
            configuration,
        });
        ActionInstance::proxy(bus, identity, &self.name, delegate, body)
    }
}

/// Produces and memoizes proxy types for one harness.
pub struct ProxyFactory {
    harness: HarnessId,
    config: HarnessConfig,
    container: Arc<Container>,
    types: Mutex<HashMap<ActionType, Arc<ProxyType>>>,
}

impl fmt::Debug for ProxyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyFactory")
            .field("harness", &self.harness)
            .field("types", &self.types.lock().len())
            .finish_non_exhaustive()
    }
}

impl ProxyFactory {
    pub fn new(harness: HarnessId, config: HarnessConfig, container: Arc<Container>) -> Self {
        Self {
            harness,
            config,
            container,
            types: Mutex::new(HashMap::new()),
        }
    }

    /// Proxy type for `subject`, created on first request.
    pub fn create_proxy(&self, subject: &ActionType) -> HarnessResult<Arc<ProxyType>> {
        self.container.ensure_registered(subject)?;
        let mut types = self.types.lock();
        let proxy = types.entry(subject.clone()).or_insert_with(|| {
            let proxy = ProxyType::new(subject.clone(), self.harness.clone(), &self.config);
            debug!(subject = %subject, proxy = %proxy.name, "synthesized proxy type");
            Arc::new(proxy)
        });
        Ok(Arc::clone(proxy))
    }

    pub fn proxy_count(&self) -> usize {
        self.types.lock().len()
    }
}

/// What a proxy observes and where its result goes.
#[derive(Debug, Clone)]
pub struct ProxyConfiguration {
    kind: ListenerKind,
    instruments: Instruments,
    sink: ResultSink,
}

impl ProxyConfiguration {
    pub fn new(kind: ListenerKind, instruments: Instruments, sink: ResultSink) -> Self {
        Self {
            kind,
            instruments,
            sink,
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Listener over `delegate`. Memory checkpoints addressed to either the
    /// delegate's innermost target or `event_source` reach it.
    pub fn create_listener(&self, delegate: &ActionInstance, event_source: &EventSource) -> Listener {
        self.instruments.create_listener(
            self.kind,
            &delegate.event_target().event_source(),
            event_source,
        )
    }

    pub fn get_result(&self, listener: &Listener) -> HarnessResult<ListenerOutput> {
        listener.result()
    }

    pub fn add_result(&self, output: ListenerOutput) {
        self.sink.add(output);
    }
}

struct Proxy {
    delegate: ActionRef,
    event_source: EventSource,
    configuration: ProxyConfiguration,
}

impl Action for Proxy {
    #[instrument(
        skip_all,
        fields(subject = %self.delegate.action_type(), feature = %self.configuration.kind)
    )]
    fn handle(&self, cx: &CallContext, args: Value) -> Result<Value> {
        let mut listener = self
            .configuration
            .create_listener(&self.delegate, &self.event_source);
        let value = listener.listen(|| self.delegate.handle(cx, args))?;
        let output = self.configuration.get_result(&listener)?;
        self.configuration.add_result(output);
        Ok(value)
    }
}

fn sha256_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionkit_container::ActionDefinition;
    use actionkit_listeners::ManualMemoryProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn container() -> Arc<Container> {
        Arc::new(Container::new(Arc::new(EventBus::new())))
    }

    #[test]
    fn proxy_types_are_memoized_per_subject() -> Result<()> {
        let container = container();
        container.register(ActionDefinition::from_fn("Import", |_cx: &CallContext, _args| {
            Ok(Value::Null)
        }));
        container.register(ActionDefinition::from_fn("Export", |_cx: &CallContext, _args| {
            Ok(Value::Null)
        }));
        let factory = ProxyFactory::new(HarnessId::new(), HarnessConfig::default(), container);

        let first = factory.create_proxy(&ActionType::new("Import"))?;
        let again = factory.create_proxy(&ActionType::new("Import"))?;
        let other = factory.create_proxy(&ActionType::new("Export"))?;

        assert!(Arc::ptr_eq(&first, &again));
        assert_ne!(first.name(), other.name());
        assert!(first.name().starts_with("Proxy_"));
        assert_eq!(first.name().len(), "Proxy_".len() + 64);
        assert_eq!(factory.proxy_count(), 2);
        Ok(())
    }

    #[test]
    fn proxy_names_differ_between_harnesses() -> Result<()> {
        let container = container();
        container.register(ActionDefinition::from_fn("Import", |_cx: &CallContext, _args| {
            Ok(Value::Null)
        }));
        let config = HarnessConfig {
            proxy_prefix: "Spy_".to_owned(),
        };
        let a = ProxyFactory::new(HarnessId::new(), config.clone(), Arc::clone(&container));
        let b = ProxyFactory::new(HarnessId::new(), config, container);

        let subject = ActionType::new("Import");
        let a = a.create_proxy(&subject)?;
        let b = b.create_proxy(&subject)?;
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("Spy_"));
        Ok(())
    }

    #[test]
    fn unregistered_subject_is_rejected() {
        let factory = ProxyFactory::new(HarnessId::new(), HarnessConfig::default(), container());
        assert!(matches!(
            factory.create_proxy(&ActionType::new("Ghost")),
            Err(actionkit_protocol::HarnessError::UnknownAction(ty)) if ty.as_str() == "Ghost"
        ));
    }

    #[test]
    fn proxy_wraps_without_constructing_the_subject() -> Result<()> {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let container = container();
        container.register(ActionDefinition::new("Import", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            |_cx: &CallContext, args: Value| -> Result<Value> { Ok(args) }
        }));
        let cx = CallContext::new(Arc::clone(&container));
        let delegate = container.make(&ActionType::new("Import"))?;
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let sink = ResultSink::default();
        let instruments = Instruments::new(
            Arc::clone(container.bus()),
            Arc::new(ManualMemoryProbe::default()),
        );
        let factory = ProxyFactory::new(HarnessId::new(), HarnessConfig::default(), container);
        let proxy = factory.create_proxy(&ActionType::new("Import"))?.instantiate(
            cx.bus(),
            Arc::clone(&delegate),
            ProxyConfiguration::new(ListenerKind::Timing, instruments, sink.clone()),
        );

        assert!(proxy.is_proxy());
        assert_eq!(proxy.action_type().as_str(), "Import");
        assert_ne!(proxy.identity(), delegate.identity());
        assert_eq!(proxy.handle(&cx, Value::from(3))?, Value::from(3));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let buffers = sink.take();
        assert_eq!(buffers.measurements.len(), 1);
        assert_eq!(buffers.measurements[0].subject.as_str(), "Import");
        Ok(())
    }
}
