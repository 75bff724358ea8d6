//! # actionkit-runtime: the harness around one root action
//!
//! A [`Testable`] wraps a resolved root action. Configuration calls record
//! what to stub and what to observe; [`Testable::handle`] then pushes a scope
//! layer onto the call context, binds stubs and installs proxies into it,
//! runs the root inside its own listeners and pops the layer again on every
//! exit path. Callbacks only run after a successful invocation.
//!
//! ## Module Overview
//!
//! - [`proxy`]: `ProxyFactory`, `ProxyType`, `ProxyConfiguration`
//! - [`sink`]: `ResultSink`, `ResultBuffers`

pub mod proxy;
pub mod sink;

use std::fmt;
use std::sync::Arc;

use actionkit_container::{ActionRef, CallContext, OnlyGuard, ScopeGuard, StubHandle};
use actionkit_listeners::{Instruments, Listener, ListenerKind};
use actionkit_protocol::{
    ActionType, HarnessError, HarnessId, HarnessResult, LogRecord, Measurement, Profile,
    QueryRecord,
};
use anyhow::Result;
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::{debug, info, instrument};

pub use proxy::{ProxyConfiguration, ProxyFactory, ProxyType};
pub use sink::{ResultBuffers, ResultSink};

/// Order in which proxies are installed and callbacks run. Later features
/// wrap earlier ones.
const FEATURE_ORDER: [ListenerKind; 4] = [
    ListenerKind::Timing,
    ListenerKind::Profile,
    ListenerKind::Queries,
    ListenerKind::Logs,
];

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub proxy_prefix: String,
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self {
            proxy_prefix: "Proxy_".to_owned(),
        }
    }

    pub fn with_proxy_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.proxy_prefix = prefix.into();
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// An action type to stub: bare, with the value its `handle` returns, or
/// through a handle the caller already configured.
#[derive(Debug, Clone, PartialEq)]
pub enum StubSpec {
    Bare(ActionType),
    Returning(ActionType, Value),
    Handle(StubHandle),
}

impl StubSpec {
    pub fn action_type(&self) -> &ActionType {
        match self {
            Self::Bare(action) | Self::Returning(action, _) => action,
            Self::Handle(handle) => handle.action_type(),
        }
    }

    /// A type name, an object mapping type names to return values, or an
    /// array mixing both.
    pub fn from_json(value: &Value) -> HarnessResult<Vec<Self>> {
        match value {
            Value::String(name) => Ok(vec![Self::from(name.as_str())]),
            Value::Object(entries) if !entries.is_empty() => Ok(entries
                .iter()
                .map(|(name, returns)| Self::Returning(ActionType::new(name), returns.clone()))
                .collect()),
            Value::Array(items) => {
                let mut specs = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(_) | Value::Object(_) => specs.extend(Self::from_json(item)?),
                        other => return Err(HarnessError::InvalidStubSpec(other.to_string())),
                    }
                }
                Ok(specs)
            }
            other => Err(HarnessError::InvalidStubSpec(other.to_string())),
        }
    }
}

impl From<&str> for StubSpec {
    fn from(name: &str) -> Self {
        Self::Bare(ActionType::new(name))
    }
}

impl From<String> for StubSpec {
    fn from(name: String) -> Self {
        Self::Bare(ActionType::new(name))
    }
}

impl From<ActionType> for StubSpec {
    fn from(action: ActionType) -> Self {
        Self::Bare(action)
    }
}

impl From<(&str, Value)> for StubSpec {
    fn from((name, returns): (&str, Value)) -> Self {
        Self::Returning(ActionType::new(name), returns)
    }
}

impl From<(ActionType, Value)> for StubSpec {
    fn from((action, returns): (ActionType, Value)) -> Self {
        Self::Returning(action, returns)
    }
}

impl From<StubHandle> for StubSpec {
    fn from(handle: StubHandle) -> Self {
        Self::Handle(handle)
    }
}

/// What a feature observes: the root action itself or the listed types
/// wherever they are resolved below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Root,
    Actions(Vec<ActionType>),
}

impl Targets {
    pub fn actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
    {
        Self::Actions(actions.into_iter().map(Into::into).collect())
    }
}

pub trait Observation: Sized + 'static {
    const KIND: ListenerKind;

    fn recorded(buffers: &ResultBuffers) -> &[Self];
}

impl Observation for Measurement {
    const KIND: ListenerKind = ListenerKind::Timing;

    fn recorded(buffers: &ResultBuffers) -> &[Self] {
        &buffers.measurements
    }
}

impl Observation for Profile {
    const KIND: ListenerKind = ListenerKind::Profile;

    fn recorded(buffers: &ResultBuffers) -> &[Self] {
        &buffers.profiles
    }
}

impl Observation for QueryRecord {
    const KIND: ListenerKind = ListenerKind::Queries;

    fn recorded(buffers: &ResultBuffers) -> &[Self] {
        &buffers.queries
    }
}

impl Observation for LogRecord {
    const KIND: ListenerKind = ListenerKind::Logs;

    fn recorded(buffers: &ResultBuffers) -> &[Self] {
        &buffers.logs
    }
}

pub type Callback<T> = Box<dyn FnMut(&[T])>;

#[derive(Default)]
struct FeaturePlan {
    root: bool,
    targets: IndexSet<ActionType>,
    callback: Option<Box<dyn FnMut(&ResultBuffers)>>,
}

struct StubEntry {
    configured: bool,
    handle: StubHandle,
}

/// Instrumentation harness around one root action.
pub struct Testable {
    id: HarnessId,
    cx: CallContext,
    root: ActionRef,
    instruments: Instruments,
    proxies: ProxyFactory,
    only: IndexSet<ActionType>,
    without: IndexMap<ActionType, StubEntry>,
    plans: IndexMap<ListenerKind, FeaturePlan>,
    sink: ResultSink,
    results: ResultBuffers,
    only_guard: Option<OnlyGuard>,
}

impl fmt::Debug for Testable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Testable")
            .field("id", &self.id)
            .field("root", &self.root.action_type())
            .field("only", &self.only)
            .field("without", &self.without.keys().collect::<Vec<_>>())
            .field("features", &self.plans.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Testable {
    pub fn new(
        cx: CallContext,
        root: impl Into<ActionType> + AsRef<str>,
        instruments: Instruments,
        config: HarnessConfig,
    ) -> Result<Self> {
        let root = cx.resolve(root)?;
        let id = HarnessId::new();
        let proxies = ProxyFactory::new(id.clone(), config, Arc::clone(cx.container()));
        Ok(Self {
            id,
            cx,
            root,
            instruments,
            proxies,
            only: IndexSet::new(),
            without: IndexMap::new(),
            plans: IndexMap::new(),
            sink: ResultSink::default(),
            results: ResultBuffers::default(),
            only_guard: None,
        })
    }

    pub fn id(&self) -> &HarnessId {
        &self.id
    }

    pub fn root(&self) -> &ActionRef {
        &self.root
    }

    pub fn context(&self) -> &CallContext {
        &self.cx
    }

    pub fn proxies(&self) -> &ProxyFactory {
        &self.proxies
    }

    /// While the root runs, stub every resolved action not listed here.
    /// Replaces any earlier list.
    pub fn only<I, S>(&mut self, actions: I) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
    {
        self.only = self.registered(actions)?;
        Ok(self)
    }

    /// Stub the listed action types for the whole invocation.
    ///
    /// A bare entry never overrides a configured one (a return value or a
    /// caller's handle) for the same type; otherwise the later entry wins.
    /// Caller handles are bound as they are, expectations included.
    pub fn without<I, S>(&mut self, specs: I) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<StubSpec>,
    {
        for spec in specs {
            let spec = spec.into();
            let action = spec.action_type().clone();
            let configured = !matches!(spec, StubSpec::Bare(_));
            self.cx.container().ensure_registered(&action)?;
            if !configured
                && self
                    .without
                    .get(&action)
                    .is_some_and(|entry| entry.configured)
            {
                continue;
            }

            let handle = match spec {
                StubSpec::Handle(handle) => handle,
                StubSpec::Returning(_, value) => self
                    .cx
                    .container()
                    .stub(&action)?
                    .expect_call("handle")
                    .then_return(value),
                StubSpec::Bare(_) => self
                    .cx
                    .container()
                    .stub(&action)?
                    .expect_call("handle")
                    .handle(),
            };
            debug!(action = %action, configured, "stub configured");
            self.without.insert(action, StubEntry { configured, handle });
        }
        Ok(self)
    }

    pub fn except<I, S>(&mut self, specs: I) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<StubSpec>,
    {
        self.without(specs)
    }

    pub fn without_json(&mut self, value: &Value) -> HarnessResult<&mut Self> {
        let specs = StubSpec::from_json(value)?;
        self.without(specs)
    }

    /// Register `callback` for the results of feature `T` over `targets`.
    /// Listing targets replaces any earlier list for the same feature.
    pub fn instrument<T: Observation>(
        &mut self,
        targets: Targets,
        callback: Option<Callback<T>>,
    ) -> HarnessResult<&mut Self> {
        let Some(mut callback) = callback else {
            return Err(HarnessError::MissingCallback {
                feature: T::KIND.feature(),
            });
        };
        let targets = match targets {
            Targets::Root => None,
            Targets::Actions(actions) => Some(self.registered(actions)?),
        };

        let plan = self.plans.entry(T::KIND).or_default();
        match targets {
            None => plan.root = true,
            Some(targets) => plan.targets = targets,
        }
        plan.callback = Some(Box::new(move |buffers: &ResultBuffers| {
            callback(T::recorded(buffers))
        }));
        Ok(self)
    }

    pub fn measure<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&[Measurement]) + 'static,
    {
        self.observe_root::<Measurement, F>(callback)
    }

    pub fn measure_actions<I, S, F>(&mut self, actions: I, callback: F) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
        F: FnMut(&[Measurement]) + 'static,
    {
        self.instrument::<Measurement>(Targets::actions(actions), Some(Box::new(callback)))
    }

    pub fn profile<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&[Profile]) + 'static,
    {
        self.observe_root::<Profile, F>(callback)
    }

    pub fn profile_actions<I, S, F>(&mut self, actions: I, callback: F) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
        F: FnMut(&[Profile]) + 'static,
    {
        self.instrument::<Profile>(Targets::actions(actions), Some(Box::new(callback)))
    }

    pub fn queries<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&[QueryRecord]) + 'static,
    {
        self.observe_root::<QueryRecord, F>(callback)
    }

    pub fn queries_actions<I, S, F>(&mut self, actions: I, callback: F) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
        F: FnMut(&[QueryRecord]) + 'static,
    {
        self.instrument::<QueryRecord>(Targets::actions(actions), Some(Box::new(callback)))
    }

    pub fn logs<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&[LogRecord]) + 'static,
    {
        self.observe_root::<LogRecord, F>(callback)
    }

    pub fn logs_actions<I, S, F>(&mut self, actions: I, callback: F) -> HarnessResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
        F: FnMut(&[LogRecord]) + 'static,
    {
        self.instrument::<LogRecord>(Targets::actions(actions), Some(Box::new(callback)))
    }

    /// On failure the error is returned unchanged and no callback runs.
    #[instrument(skip_all, fields(root = %self.root.action_type(), harness = %self.id))]
    pub fn handle(&mut self, args: Value) -> Result<Value> {
        self.sink.reset();
        let outcome = self.run(args);
        self.results = self.sink.take();
        let value = outcome?;

        for kind in FEATURE_ORDER {
            if let Some(plan) = self.plans.get_mut(&kind)
                && let Some(callback) = plan.callback.as_mut()
            {
                callback(&self.results);
            }
        }
        info!(
            measurements = self.results.measurements.len(),
            profiles = self.results.profiles.len(),
            queries = self.results.queries.len(),
            logs = self.results.logs.len(),
            "harness run complete"
        );
        Ok(value)
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.results.measurements
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.results.profiles
    }

    pub fn queries_recorded(&self) -> &[QueryRecord] {
        &self.results.queries
    }

    pub fn logs_recorded(&self) -> &[LogRecord] {
        &self.results.logs
    }

    pub fn results(&self) -> &ResultBuffers {
        &self.results
    }

    /// Stub from `without`, or one the `only` guard created last run.
    pub fn stub(&self, action: impl Into<ActionType>) -> Option<StubHandle> {
        let action = action.into();
        self.without
            .get(&action)
            .map(|entry| entry.handle.clone())
            .or_else(|| {
                self.only_guard
                    .as_ref()
                    .and_then(|guard| guard.created_stub(&action))
            })
    }

    fn observe_root<T, F>(&mut self, callback: F) -> &mut Self
    where
        T: Observation,
        F: FnMut(&[T]) + 'static,
    {
        let mut callback = callback;
        let plan = self.plans.entry(T::KIND).or_default();
        plan.root = true;
        plan.callback = Some(Box::new(move |buffers: &ResultBuffers| {
            callback(T::recorded(buffers))
        }));
        self
    }

    fn registered<I, S>(&self, actions: I) -> HarnessResult<IndexSet<ActionType>>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
    {
        actions
            .into_iter()
            .map(|action| {
                let action = action.into();
                self.cx.container().ensure_registered(&action)?;
                Ok(action)
            })
            .collect()
    }

    fn run(&mut self, args: Value) -> Result<Value> {
        let scope = self.cx.enter_scope(format!("harness {}", self.id));

        for entry in self.without.values() {
            scope.bind_stub(&entry.handle);
        }
        self.only_guard = (!self.only.is_empty()).then(|| {
            let guard = OnlyGuard::new(self.root.action_type().clone(), self.only.iter().cloned());
            scope.guard_only(guard.clone());
            guard
        });
        self.install_proxies(&scope)?;

        let subject = self.root.event_target().event_source();
        let mut listeners: Vec<Listener> = FEATURE_ORDER
            .iter()
            .rev()
            .filter(|kind| self.plans.get(*kind).is_some_and(|plan| plan.root))
            .map(|kind| self.instruments.create_listener(*kind, &subject, &subject))
            .collect();

        let root = Arc::clone(&self.root);
        let cx = self.cx.clone();
        let value = run_within(&mut listeners, Box::new(move || root.handle(&cx, args)))?;

        // Innermost listener completed first.
        for listener in listeners.iter().rev() {
            self.sink.add(listener.result()?);
        }
        Ok(value)
    }

    fn install_proxies(&self, scope: &ScopeGuard) -> HarnessResult<()> {
        for kind in FEATURE_ORDER {
            let Some(plan) = self.plans.get(&kind) else {
                continue;
            };
            for action in &plan.targets {
                let proxy_type = self.proxies.create_proxy(action)?;
                let configuration =
                    ProxyConfiguration::new(kind, self.instruments.clone(), self.sink.clone());
                scope.install(action.clone(), move |cx, original| {
                    Ok(proxy_type.instantiate(cx.bus(), original, configuration.clone()))
                });
            }
        }
        Ok(())
    }
}

// First listener outermost.
fn run_within<'a>(
    listeners: &'a mut [Listener],
    work: Box<dyn FnOnce() -> Result<Value> + 'a>,
) -> Result<Value> {
    match listeners.split_first_mut() {
        None => work(),
        Some((outer, rest)) => outer.listen(move || run_within(rest, work)),
    }
}
