use std::fmt;
use std::sync::Arc;

use actionkit_container::{ActionDefinition, ActionRef, CallContext, Container, StubHandle, Within};
use actionkit_events::EventBus;
use actionkit_listeners::{
    Instruments, LogCaptureLayer, LogFeed, MemoryProbe, ProcessMemoryProbe, QueryFeed,
};
use actionkit_protocol::ActionType;
use actionkit_runtime::{HarnessConfig, Testable};
use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct KernelBuilder {
    definitions: Vec<ActionDefinition>,
    probe: Option<Arc<dyn MemoryProbe>>,
    harness_config: HarnessConfig,
}

impl fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("definitions", &self.definitions)
            .field("harness_config", &self.harness_config)
            .finish_non_exhaustive()
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            definitions: Vec::new(),
            probe: None,
            harness_config: HarnessConfig::default(),
        }
    }

    pub fn register(mut self, definition: ActionDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn definitions(mut self, definitions: impl IntoIterator<Item = ActionDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    /// Defaults to [`ProcessMemoryProbe`].
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn harness_config(mut self, config: HarnessConfig) -> Self {
        self.harness_config = config;
        self
    }

    pub fn build(self) -> ActionKernel {
        let bus = Arc::new(EventBus::new());
        let container = Arc::new(Container::new(Arc::clone(&bus)));
        for definition in self.definitions {
            container.register(definition);
        }
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcessMemoryProbe::new()) as Arc<dyn MemoryProbe>);
        debug!(actions = container.action_types().len(), "kernel built");

        ActionKernel {
            container,
            instruments: Instruments::new(bus, probe),
            harness_config: self.harness_config,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionKernel {
    container: Arc<Container>,
    instruments: Instruments,
    harness_config: HarnessConfig,
}

impl ActionKernel {
    /// Fresh call context. Overrides installed on one context are invisible
    /// to every other.
    pub fn context(&self) -> CallContext {
        CallContext::new(Arc::clone(&self.container))
    }

    pub fn register(&self, definition: ActionDefinition) {
        self.container.register(definition);
    }

    pub fn resolve(
        &self,
        cx: &CallContext,
        action: impl Into<ActionType> + AsRef<str>,
    ) -> Result<ActionRef> {
        cx.resolve(action)
    }

    /// Run `action` on a fresh context.
    #[instrument(skip(self, action, args), fields(action = %action.as_ref()))]
    pub fn call(&self, action: impl Into<ActionType> + AsRef<str>, args: Value) -> Result<Value> {
        self.context().call(action, args)
    }

    /// Stub `action` on `cx` until restored or the context is dropped.
    pub fn fake(&self, cx: &CallContext, action: impl Into<ActionType>) -> Result<StubHandle> {
        Ok(cx.fake(action)?)
    }

    pub fn within<I, S>(
        &self,
        cx: &CallContext,
        root: impl Into<ActionType>,
        allowed: I,
    ) -> Result<Within>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
    {
        Ok(cx.within(root, allowed)?)
    }

    /// Harness around `root`, resolved through `cx`.
    pub fn testable(
        &self,
        cx: &CallContext,
        root: impl Into<ActionType> + AsRef<str>,
    ) -> Result<Testable> {
        Testable::new(
            cx.clone(),
            root,
            self.instruments.clone(),
            self.harness_config.clone(),
        )
    }

    /// Harness around `root` on a fresh context.
    pub fn testable_for(&self, root: impl Into<ActionType> + AsRef<str>) -> Result<Testable> {
        self.testable(&self.context(), root)
    }

    pub fn query_feed(&self) -> &Arc<QueryFeed> {
        &self.instruments.queries
    }

    pub fn log_feed(&self) -> &Arc<LogFeed> {
        &self.instruments.logs
    }

    /// `tracing_subscriber` layer feeding this kernel's log feed.
    pub fn log_layer(&self) -> LogCaptureLayer {
        LogCaptureLayer::new(Arc::clone(&self.instruments.logs))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.instruments.bus
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actionkit_container::{ActionDefinition, CallContext};
    use actionkit_listeners::{ManualMemoryProbe, QueryExecuted};
    use actionkit_protocol::{ActionType, LogLevel, LogRecord};
    use anyhow::Result;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tracing_subscriber::layer::SubscriberExt;

    use crate::KernelBuilder;

    fn echo(name: &str) -> ActionDefinition {
        let label = name.to_owned();
        ActionDefinition::from_fn(name, move |_cx: &CallContext, _args: Value| {
            Ok(json!(label))
        })
    }

    #[test]
    fn built_kernel_resolves_registered_actions() -> Result<()> {
        let kernel = KernelBuilder::new()
            .register(echo("Ping"))
            .memory_probe(Arc::new(ManualMemoryProbe::new(0)))
            .build();

        assert_eq!(kernel.call("Ping", Value::Null)?, json!("Ping"));
        let cx = kernel.context();
        assert_eq!(kernel.resolve(&cx, "Ping")?.action_type().as_str(), "Ping");
        assert!(kernel.call("Pong", Value::Null).is_err());
        Ok(())
    }

    #[test]
    fn contexts_do_not_share_overrides() -> Result<()> {
        let kernel = KernelBuilder::new().register(echo("Mailer")).build();
        let first = kernel.context();
        let second = kernel.context();

        let scope = first.enter_scope("isolation");
        scope.bind_stub(&kernel.container().stub(&ActionType::new("Mailer"))?);

        assert!(first.resolve("Mailer")?.stub_handle().is_some());
        assert_eq!(second.call("Mailer", Value::Null)?, json!("Mailer"));
        drop(scope);
        assert!(first.resolve("Mailer")?.stub_handle().is_none());
        Ok(())
    }

    #[test]
    fn fake_and_within_work_without_a_harness() -> Result<()> {
        let kernel = KernelBuilder::new()
            .register(echo("Greeting"))
            .register(echo("Farewell"))
            .register(ActionDefinition::from_fn(
                "MiddleMan",
                |cx: &CallContext, _args: Value| {
                    Ok(json!([
                        cx.call("Greeting", Value::Null)?,
                        cx.call("Farewell", Value::Null)?
                    ]))
                },
            ))
            .build();

        let cx = kernel.context();
        kernel
            .fake(&cx, "Greeting")?
            .expect_call("handle")
            .then_return(json!("hi"));
        assert_eq!(cx.call("MiddleMan", Value::Null)?, json!(["hi", "Farewell"]));

        let within = kernel.within(&cx, "MiddleMan", ["Greeting"])?;
        assert_eq!(within.handle(Value::Null)?, json!(["hi", null]));
        drop(within);
        assert_eq!(kernel.call("MiddleMan", Value::Null)?, json!(["Greeting", "Farewell"]));
        Ok(())
    }

    #[test]
    fn testable_captures_queries_through_the_kernel_feed() -> Result<()> {
        let kernel = KernelBuilder::new()
            .memory_probe(Arc::new(ManualMemoryProbe::new(0)))
            .build();
        let feed = Arc::clone(kernel.query_feed());
        kernel.register(ActionDefinition::from_fn(
            "Checkout",
            move |_cx: &CallContext, _args: Value| {
                feed.notify(&QueryExecuted::new("insert into orders", vec![json!(99)], 4.0));
                Ok(json!("ok"))
            },
        ));

        let mut harness = kernel.testable_for("Checkout")?;
        harness.queries(|_| {}).measure(|_| {});
        assert_eq!(harness.handle(Value::Null)?, json!("ok"));
        assert_eq!(harness.queries_recorded().len(), 1);
        assert_eq!(harness.measurements().len(), 1);
        Ok(())
    }

    #[test]
    fn tracing_events_inside_actions_are_captured_as_logs() -> Result<()> {
        let kernel = KernelBuilder::new()
            .register(ActionDefinition::from_fn(
                "Notify",
                |_cx: &CallContext, _args: Value| {
                    tracing::warn!(target: "mail", recipient = "ops", "bounce");
                    Ok(Value::Null)
                },
            ))
            .memory_probe(Arc::new(ManualMemoryProbe::new(0)))
            .build();

        let seen: Arc<Mutex<Vec<LogRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut harness = kernel.testable_for("Notify")?;
        harness.logs(move |logs| sink.lock().extend_from_slice(logs));

        let subscriber = tracing_subscriber::registry().with(kernel.log_layer());
        tracing::subscriber::with_default(subscriber, || harness.handle(Value::Null))?;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, LogLevel::Warning);
        assert_eq!(seen[0].channel, "mail");
        assert_eq!(seen[0].message, "bounce");
        assert_eq!(seen[0].context.get("recipient"), Some(&json!("ops")));
        Ok(())
    }
}
