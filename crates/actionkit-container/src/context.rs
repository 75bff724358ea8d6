//! Call context: the explicit call-frame stack, the scope layers holding
//! per-invocation overrides, and the relay ledger for event propagation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use actionkit_events::{EventBus, PropagationKey, PropagationLedger};
use actionkit_protocol::{ActionType, HarnessError, HarnessResult};
use anyhow::Result;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::instance::{ActionInstance, ActionRef};
use crate::registry::Container;
use crate::stub::StubHandle;
use crate::within::Within;

/// Answers `resolve(type)` in place of the container while installed.
pub type Resolution = Arc<dyn Fn(&CallContext) -> Result<ActionRef> + Send + Sync>;

/// Stubs every action type outside `allowed` that is resolved while an
/// instance of `root` is running.
#[derive(Debug, Clone)]
pub struct OnlyGuard {
    root: ActionType,
    allowed: IndexSet<ActionType>,
    created: Arc<Mutex<IndexMap<ActionType, StubHandle>>>,
}

impl OnlyGuard {
    pub fn new<I>(root: ActionType, allowed: I) -> Self
    where
        I: IntoIterator<Item = ActionType>,
    {
        Self {
            root,
            allowed: allowed.into_iter().collect(),
            created: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    pub fn root(&self) -> &ActionType {
        &self.root
    }

    pub fn allows(&self, action: &ActionType) -> bool {
        self.allowed.contains(action)
    }

    pub fn created_stubs(&self) -> Vec<StubHandle> {
        self.created.lock().values().cloned().collect()
    }

    pub fn created_stub(&self, action: &ActionType) -> Option<StubHandle> {
        self.created.lock().get(action).cloned()
    }
}

struct ScopeLayer {
    id: u64,
    label: String,
    stubs: HashMap<ActionType, ActionRef>,
    interceptions: HashMap<ActionType, Resolution>,
    only: Option<OnlyGuard>,
}

struct ContextInner {
    container: Arc<Container>,
    frames: Mutex<Vec<ActionRef>>,
    scopes: Mutex<Vec<ScopeLayer>>,
    fakes: Mutex<HashMap<ActionType, ActionRef>>,
    ledger: Mutex<PropagationLedger>,
    next_scope: AtomicU64,
}

/// Per-call-chain state. Clones share it; overrides never cross contexts.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scopes: Vec<String> = self
            .inner
            .scopes
            .lock()
            .iter()
            .map(|layer| layer.label.clone())
            .collect();
        f.debug_struct("CallContext")
            .field("depth", &self.depth())
            .field("scopes", &scopes)
            .finish_non_exhaustive()
    }
}

impl CallContext {
    pub fn new(container: Arc<Container>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                container,
                frames: Mutex::new(Vec::new()),
                scopes: Mutex::new(Vec::new()),
                fakes: Mutex::new(HashMap::new()),
                ledger: Mutex::new(PropagationLedger::default()),
                next_scope: AtomicU64::new(1),
            }),
        }
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.inner.container
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.inner.container.bus()
    }

    // Only guards may bind a stub first; the innermost interception wins
    // over stubs and fakes.
    #[instrument(skip_all, fields(action = %action.as_ref()))]
    pub fn resolve(&self, action: impl Into<ActionType> + AsRef<str>) -> Result<ActionRef> {
        let action: ActionType = action.into();
        self.inner.container.ensure_registered(&action)?;

        self.apply_only_guards(&action);

        if let Some(resolution) = self.interception(&action) {
            return resolution(self);
        }
        self.resolve_base(&action)
    }

    pub fn call(&self, action: impl Into<ActionType> + AsRef<str>, args: Value) -> Result<Value> {
        let instance = self.resolve(action)?;
        instance.handle(self, args)
    }

    pub fn resolve_base(&self, action: &ActionType) -> Result<ActionRef> {
        let stub = {
            let scopes = self.inner.scopes.lock();
            scopes
                .iter()
                .rev()
                .find_map(|layer| layer.stubs.get(action).cloned())
        };
        let stub = stub.or_else(|| self.inner.fakes.lock().get(action).cloned());
        match stub {
            Some(stub) => Ok(stub),
            None => self.inner.container.make(action),
        }
    }

    /// Stub `action` for the rest of this context's life. The handle starts
    /// without expectations, so every call fails until one is configured.
    pub fn fake(&self, action: impl Into<ActionType>) -> HarnessResult<StubHandle> {
        let action = action.into();
        let handle = self.inner.container.stub(&action)?;
        let instance = self.inner.container.instantiate_stub(&handle);
        debug!(action = %action, "fake action");
        let replaced = self.inner.fakes.lock().insert(action, instance);
        drop(replaced);
        Ok(handle)
    }

    pub fn restore(&self, action: &ActionType) -> bool {
        let removed = self.inner.fakes.lock().remove(action);
        removed.is_some()
    }

    /// Guard plain runs of `root`: while it executes, every resolved action
    /// outside `allowed` is stubbed. An empty list guards nothing.
    pub fn within<I, S>(&self, root: impl Into<ActionType>, allowed: I) -> HarnessResult<Within>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
    {
        Within::new(self, root.into(), allowed)
    }

    pub fn interception(&self, action: &ActionType) -> Option<Resolution> {
        let scopes = self.inner.scopes.lock();
        scopes
            .iter()
            .rev()
            .find_map(|layer| layer.interceptions.get(action).cloned())
    }

    fn has_stub(&self, action: &ActionType) -> bool {
        self.inner
            .scopes
            .lock()
            .iter()
            .any(|layer| layer.stubs.contains_key(action))
            || self.inner.fakes.lock().contains_key(action)
    }

    fn apply_only_guards(&self, action: &ActionType) {
        let guards: Vec<(u64, OnlyGuard)> = {
            let scopes = self.inner.scopes.lock();
            scopes
                .iter()
                .rev()
                .filter_map(|layer| layer.only.clone().map(|guard| (layer.id, guard)))
                .collect()
        };

        for (layer_id, guard) in guards {
            if guard.allows(action) || !self.is_running(guard.root()) {
                continue;
            }
            if self.has_stub(action) {
                return;
            }
            let handle = StubHandle::new(action.clone());
            handle.expect_call("handle");
            let instance = self.inner.container.instantiate_stub(&handle);
            debug!(action = %action, root = %guard.root(), "only guard stubbed action");
            self.with_layer(layer_id, |layer| {
                layer.stubs.insert(action.clone(), instance);
            });
            guard.created.lock().insert(action.clone(), handle);
            return;
        }
    }

    pub fn current(&self) -> Option<ActionRef> {
        self.inner.frames.lock().last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.inner.frames.lock().len()
    }

    pub fn is_running(&self, action: &ActionType) -> bool {
        self.inner
            .frames
            .lock()
            .iter()
            .any(|frame| frame.action_type() == action)
    }

    pub fn frames(&self) -> Vec<ActionRef> {
        self.inner.frames.lock().clone()
    }

    pub fn emit(&self, event: &str, data: Value) -> HarnessResult<()> {
        let current = self.current().ok_or(HarnessError::NoActiveAction)?;
        current.emit(self, event, data)
    }

    pub fn record_memory(&self, label: &str) -> HarnessResult<()> {
        let current = self.current().ok_or(HarnessError::NoActiveAction)?;
        current.record_memory(label);
        Ok(())
    }

    pub fn enter_scope(&self, label: impl Into<String>) -> ScopeGuard {
        let id = self.inner.next_scope.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        debug!(scope = id, %label, "enter scope");
        self.inner.scopes.lock().push(ScopeLayer {
            id,
            label,
            stubs: HashMap::new(),
            interceptions: HashMap::new(),
            only: None,
        });
        ScopeGuard {
            cx: self.clone(),
            id,
        }
    }

    pub fn scope_depth(&self) -> usize {
        self.inner.scopes.lock().len()
    }

    fn with_layer<R>(&self, id: u64, f: impl FnOnce(&mut ScopeLayer) -> R) -> Option<R> {
        let mut scopes = self.inner.scopes.lock();
        scopes.iter_mut().find(|layer| layer.id == id).map(f)
    }

    pub(crate) fn push_frame(&self, instance: ActionRef) -> FrameGuard {
        self.inner.frames.lock().push(Arc::clone(&instance));
        FrameGuard {
            cx: self.clone(),
            instance,
        }
    }

    pub(crate) fn enter_cascade(&self) -> CascadeGuard {
        self.inner.ledger.lock().enter();
        CascadeGuard { cx: self.clone() }
    }

    pub(crate) fn propagate(
        &self,
        emitter: &ActionInstance,
        event: &str,
        data: Value,
    ) -> HarnessResult<()> {
        let ancestor = {
            let frames = self.inner.frames.lock();
            let start = frames
                .iter()
                .rposition(|frame| frame.identity() == emitter.identity())
                .unwrap_or(frames.len());
            frames[..start]
                .iter()
                .rev()
                .find(|frame| {
                    frame.identity() != emitter.identity() && frame.is_event_capable()
                })
                .cloned()
        };

        let Some(ancestor) = ancestor else {
            debug!(event, from = %emitter.action_type(), "no event-capable ancestor");
            return Ok(());
        };
        if !ancestor.declares(event) {
            debug!(
                event,
                from = %emitter.action_type(),
                to = %ancestor.action_type(),
                "ancestor does not declare event"
            );
            return Ok(());
        }

        let key = PropagationKey {
            source: emitter.identity().clone(),
            target: ancestor.identity().clone(),
            event: event.to_owned(),
        };
        if !self.inner.ledger.lock().try_mark(key) {
            debug!(
                event,
                from = %emitter.action_type(),
                to = %ancestor.action_type(),
                "relay already used in this cascade"
            );
            return Ok(());
        }

        debug!(
            event,
            from = %emitter.action_type(),
            to = %ancestor.action_type(),
            "relay event"
        );
        ancestor.emit(self, event, data)
    }
}

pub struct ScopeGuard {
    cx: CallContext,
    id: u64,
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGuard").field("id", &self.id).finish()
    }
}

impl ScopeGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &CallContext {
        &self.cx
    }

    pub fn bind_stub(&self, handle: &StubHandle) -> ActionRef {
        let action = handle.action_type().clone();
        let instance = self.cx.inner.container.instantiate_stub(handle);
        debug!(scope = self.id, action = %action, "bind stub");
        let replaced = self.cx.with_layer(self.id, |layer| {
            layer.stubs.insert(action, Arc::clone(&instance))
        });
        drop(replaced);
        instance
    }

    /// `wrap` receives what the previous resolution would have produced:
    /// the innermost earlier interception, or the base resolution.
    pub fn install<W>(&self, action: ActionType, wrap: W)
    where
        W: Fn(&CallContext, ActionRef) -> Result<ActionRef> + Send + Sync + 'static,
    {
        let previous = self.cx.interception(&action);
        let chained = previous.is_some();
        let base = action.clone();
        let resolution: Resolution = Arc::new(move |cx| {
            let original = match &previous {
                Some(previous) => previous(cx)?,
                None => cx.resolve_base(&base)?,
            };
            wrap(cx, original)
        });
        debug!(scope = self.id, action = %action, chained, "install interception");
        let replaced = self.cx.with_layer(self.id, |layer| {
            layer.interceptions.insert(action, resolution)
        });
        drop(replaced);
    }

    pub fn guard_only(&self, guard: OnlyGuard) {
        debug!(scope = self.id, root = %guard.root(), allowed = guard.allowed.len(), "install only guard");
        self.cx.with_layer(self.id, |layer| layer.only = Some(guard));
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let layer = {
            let mut scopes = self.cx.inner.scopes.lock();
            scopes
                .iter()
                .position(|layer| layer.id == self.id)
                .map(|pos| scopes.remove(pos))
        };
        debug!(scope = self.id, "exit scope");
        // Stub instances release their bus entries here, outside the lock.
        drop(layer);
    }
}

pub(crate) struct FrameGuard {
    cx: CallContext,
    instance: ActionRef,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let popped = {
            let mut frames = self.cx.inner.frames.lock();
            frames
                .iter()
                .rposition(|frame| Arc::ptr_eq(frame, &self.instance))
                .map(|pos| frames.remove(pos))
        };
        drop(popped);
    }
}

pub(crate) struct CascadeGuard {
    cx: CallContext,
}

impl Drop for CascadeGuard {
    fn drop(&mut self) {
        self.cx.inner.ledger.lock().exit();
    }
}
