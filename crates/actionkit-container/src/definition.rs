use std::fmt;
use std::sync::Arc;

use actionkit_protocol::{ActionType, CapabilityDeclaration, HarnessResult};
use anyhow::Result;
use serde_json::Value;

use crate::context::CallContext;

/// A unit of work with a single entry point.
///
/// Nested actions are resolved through `cx`, never constructed directly, so
/// that an active harness can substitute stubs or instrumented proxies.
pub trait Action: Send + Sync {
    fn handle(&self, cx: &CallContext, args: Value) -> Result<Value>;
}

impl<F> Action for F
where
    F: Fn(&CallContext, Value) -> Result<Value> + Send + Sync,
{
    fn handle(&self, cx: &CallContext, args: Value) -> Result<Value> {
        self(cx, args)
    }
}

pub type ActionFactory = Arc<dyn Fn() -> Result<Arc<dyn Action>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// A fresh instance per resolution.
    #[default]
    Transient,
    /// One instance shared by every resolution, across call contexts.
    Singleton,
}

/// How the container builds one action type, and which events it declares.
#[derive(Clone)]
pub struct ActionDefinition {
    action_type: ActionType,
    capabilities: Option<Arc<CapabilityDeclaration>>,
    lifetime: Lifetime,
    factory: ActionFactory,
}

impl fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("action_type", &self.action_type)
            .field("capabilities", &self.capabilities)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl ActionDefinition {
    pub fn new<A, F>(action_type: impl Into<ActionType>, factory: F) -> Self
    where
        A: Action + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::with_factory(action_type, move || {
            let action: Arc<dyn Action> = Arc::new(factory());
            Ok(action)
        })
    }

    /// Like [`ActionDefinition::new`] for constructors that can fail.
    pub fn try_new<A, F>(action_type: impl Into<ActionType>, factory: F) -> Self
    where
        A: Action + 'static,
        F: Fn() -> Result<A> + Send + Sync + 'static,
    {
        Self::with_factory(action_type, move || {
            let action: Arc<dyn Action> = Arc::new(factory()?);
            Ok(action)
        })
    }

    /// Define an action from a closure. Every instance shares the closure.
    pub fn from_fn<F>(action_type: impl Into<ActionType>, body: F) -> Self
    where
        F: Fn(&CallContext, Value) -> Result<Value> + Send + Sync + 'static,
    {
        let body: Arc<dyn Action> = Arc::new(body);
        Self::with_factory(action_type, move || Ok(Arc::clone(&body)))
    }

    fn with_factory<F>(action_type: impl Into<ActionType>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Action>> + Send + Sync + 'static,
    {
        Self {
            action_type: action_type.into(),
            capabilities: None,
            lifetime: Lifetime::Transient,
            factory: Arc::new(factory),
        }
    }

    /// Declare the events this type may emit or listen for.
    pub fn emits<I, S>(mut self, events: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(Arc::new(CapabilityDeclaration::new(events)?));
        Ok(self)
    }

    pub fn singleton(mut self) -> Self {
        self.lifetime = Lifetime::Singleton;
        self
    }

    pub fn action_type(&self) -> &ActionType {
        &self.action_type
    }

    pub fn capabilities(&self) -> Option<&Arc<CapabilityDeclaration>> {
        self.capabilities.as_ref()
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub(crate) fn build(&self) -> Result<Arc<dyn Action>> {
        (self.factory)()
    }
}
