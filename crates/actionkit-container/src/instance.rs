use std::fmt;
use std::sync::{Arc, Weak};

use actionkit_events::{EventBus, EventSource, RECORD_MEMORY_EVENT, SubscriptionId};
use actionkit_protocol::{
    ActionType, CapabilityDeclaration, EventVerb, HarnessError, HarnessResult, Identity,
    check_event,
};
use anyhow::Result;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::context::CallContext;
use crate::definition::Action;
use crate::stub::StubHandle;

pub type ActionRef = Arc<ActionInstance>;

#[derive(Debug, Clone)]
pub enum InstanceKind {
    /// Built by the container from the type's definition.
    Concrete,
    /// Stand-in created from a [`StubHandle`].
    Stub(StubHandle),
    /// Wrapper that delegates to another instance of the same type.
    Proxy { name: String },
}

/// A resolved action: its body plus identity, declaration and forwarding
/// state.
///
/// Proxies share the declaration of the type they wrap. Event operations on a
/// proxy are applied to the innermost wrapped instance, which is the one that
/// actually runs and emits.
pub struct ActionInstance {
    identity: Identity,
    action_type: ActionType,
    capabilities: Option<Arc<CapabilityDeclaration>>,
    kind: InstanceKind,
    body: Arc<dyn Action>,
    delegate: Option<ActionRef>,
    forwarding: Mutex<IndexSet<String>>,
    bus: Weak<EventBus>,
}

impl fmt::Debug for ActionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInstance")
            .field("identity", &self.identity)
            .field("action_type", &self.action_type)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl ActionInstance {
    pub fn concrete(
        bus: &Arc<EventBus>,
        action_type: ActionType,
        capabilities: Option<Arc<CapabilityDeclaration>>,
        body: Arc<dyn Action>,
    ) -> ActionRef {
        Arc::new(Self {
            identity: Identity::new(),
            action_type,
            capabilities,
            kind: InstanceKind::Concrete,
            body,
            delegate: None,
            forwarding: Mutex::new(IndexSet::new()),
            bus: Arc::downgrade(bus),
        })
    }

    pub fn stub(
        bus: &Arc<EventBus>,
        capabilities: Option<Arc<CapabilityDeclaration>>,
        handle: StubHandle,
    ) -> ActionRef {
        let body: Arc<dyn Action> = Arc::new(crate::stub::StubAction {
            handle: handle.clone(),
        });
        Arc::new(Self {
            identity: Identity::new(),
            action_type: handle.action_type().clone(),
            capabilities,
            kind: InstanceKind::Stub(handle),
            body,
            delegate: None,
            forwarding: Mutex::new(IndexSet::new()),
            bus: Arc::downgrade(bus),
        })
    }

    /// Wrap `delegate`. The identity is supplied by the caller so the body can
    /// be built knowing its own event source.
    pub fn proxy(
        bus: &Arc<EventBus>,
        identity: Identity,
        name: impl Into<String>,
        delegate: ActionRef,
        body: Arc<dyn Action>,
    ) -> ActionRef {
        Arc::new(Self {
            identity,
            action_type: delegate.action_type.clone(),
            capabilities: delegate.capabilities.clone(),
            kind: InstanceKind::Proxy { name: name.into() },
            body,
            delegate: Some(delegate),
            forwarding: Mutex::new(IndexSet::new()),
            bus: Arc::downgrade(bus),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn action_type(&self) -> &ActionType {
        &self.action_type
    }

    /// The proxy type name for proxies, the action type otherwise.
    pub fn type_name(&self) -> &str {
        match &self.kind {
            InstanceKind::Proxy { name } => name,
            _ => self.action_type.as_str(),
        }
    }

    pub fn capabilities(&self) -> Option<&CapabilityDeclaration> {
        self.capabilities.as_deref()
    }

    pub fn is_event_capable(&self) -> bool {
        self.capabilities.is_some()
    }

    pub fn declares(&self, event: &str) -> bool {
        self.capabilities
            .as_deref()
            .is_some_and(|declaration| declaration.allows(event))
    }

    pub fn kind(&self) -> &InstanceKind {
        &self.kind
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, InstanceKind::Proxy { .. })
    }

    pub fn stub_handle(&self) -> Option<&StubHandle> {
        match &self.kind {
            InstanceKind::Stub(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn delegate(&self) -> Option<&ActionRef> {
        self.delegate.as_ref()
    }

    /// Innermost instance behind any proxy layers.
    pub fn event_target(&self) -> &ActionInstance {
        let mut current = self;
        while let Some(delegate) = &current.delegate {
            current = delegate;
        }
        current
    }

    pub fn event_source(&self) -> EventSource {
        EventSource::new(self.action_type.clone(), self.identity.clone())
    }

    /// Run the action. Concrete instances occupy a call frame for the
    /// duration of the call.
    pub fn handle(self: &Arc<Self>, cx: &CallContext, args: Value) -> Result<Value> {
        let _frame = matches!(self.kind, InstanceKind::Concrete)
            .then(|| cx.push_frame(Arc::clone(self)));
        self.body.handle(cx, args)
    }

    /// Subscribe to a declared event of this instance.
    pub fn on<F>(&self, event: &str, callback: F) -> HarnessResult<SubscriptionId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let target = self.event_target();
        check_event(
            target.capabilities(),
            &target.action_type,
            event,
            EventVerb::Listen,
        )?;
        let bus = target.bus.upgrade().ok_or(HarnessError::BusClosed)?;
        Ok(bus.subscribe(target.event_source().key(event), Arc::new(callback)))
    }

    /// Publish a declared event to this instance's subscribers, then relay it
    /// to the nearest event-capable caller when forwarding is enabled for it.
    pub fn emit(&self, cx: &CallContext, event: &str, data: Value) -> HarnessResult<()> {
        let target = self.event_target();
        check_event(
            target.capabilities(),
            &target.action_type,
            event,
            EventVerb::Emit,
        )?;

        let _cascade = cx.enter_cascade();
        if let Some(bus) = target.bus.upgrade() {
            bus.publish(&target.event_source().key(event), &data);
        }
        if target.forwards(event) {
            cx.propagate(target, event, data)?;
        }
        Ok(())
    }

    /// Replace the forwarding set.
    pub fn forward_events<I, S>(&self, events: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = self.event_target();
        let events: IndexSet<String> = events.into_iter().map(Into::into).collect();
        debug!(action = %target.action_type, ?events, "forward events");
        *target.forwarding.lock() = events;
    }

    /// Forward every declared event.
    pub fn forward_all_events(&self) {
        let target = self.event_target();
        let events = target
            .capabilities
            .as_deref()
            .map(|declaration| declaration.events().to_vec())
            .unwrap_or_default();
        target.forward_events(events);
    }

    pub fn forwards(&self, event: &str) -> bool {
        self.event_target().forwarding.lock().contains(event)
    }

    pub fn forwarded_events(&self) -> Vec<String> {
        self.event_target()
            .forwarding
            .lock()
            .iter()
            .cloned()
            .collect()
    }

    /// Ask any profiler attached to this instance for a memory checkpoint.
    pub fn record_memory(&self, label: &str) {
        let target = self.event_target();
        if let Some(bus) = target.bus.upgrade() {
            bus.publish(
                &target.event_source().key(RECORD_MEMORY_EVENT),
                &Value::String(label.to_owned()),
            );
        }
    }

    /// Drop every bus entry registered under this identity. A no-op once the
    /// bus itself is gone.
    pub fn dispose(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.forget(&self.identity);
        }
    }
}

impl Drop for ActionInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}
