use std::collections::HashMap;
use std::sync::Arc;

use actionkit_events::EventBus;
use actionkit_protocol::{ActionType, CapabilityDeclaration, HarnessError, HarnessResult};
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::definition::{ActionDefinition, Lifetime};
use crate::instance::{ActionInstance, ActionRef};
use crate::stub::StubHandle;

/// Registry of action definitions plus the singleton cache.
///
/// Definitions never change while a harness is active: per-invocation
/// overrides live on the [`CallContext`](crate::CallContext), not here.
#[derive(Debug)]
pub struct Container {
    bus: Arc<EventBus>,
    definitions: RwLock<HashMap<ActionType, ActionDefinition>>,
    singletons: Mutex<HashMap<ActionType, ActionRef>>,
}

impl Container {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            definitions: RwLock::new(HashMap::new()),
            singletons: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register or replace a definition. Replacing drops a cached singleton.
    pub fn register(&self, definition: ActionDefinition) {
        let action_type = definition.action_type().clone();
        debug!(action = %action_type, lifetime = ?definition.lifetime(), "register action");
        self.definitions
            .write()
            .insert(action_type.clone(), definition);
        let stale = self.singletons.lock().remove(&action_type);
        drop(stale);
    }

    pub fn is_registered(&self, action: &ActionType) -> bool {
        self.definitions.read().contains_key(action)
    }

    pub fn ensure_registered(&self, action: &ActionType) -> HarnessResult<()> {
        if self.is_registered(action) {
            Ok(())
        } else {
            Err(HarnessError::UnknownAction(action.clone()))
        }
    }

    pub fn definition(&self, action: &ActionType) -> HarnessResult<ActionDefinition> {
        self.definitions
            .read()
            .get(action)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownAction(action.clone()))
    }

    pub fn capabilities(&self, action: &ActionType) -> Option<Arc<CapabilityDeclaration>> {
        self.definitions
            .read()
            .get(action)
            .and_then(|definition| definition.capabilities().cloned())
    }

    pub fn action_types(&self) -> Vec<ActionType> {
        let mut types: Vec<ActionType> = self.definitions.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Build an instance from the registered definition, ignoring any
    /// overrides.
    pub fn make(&self, action: &ActionType) -> Result<ActionRef> {
        let definition = self.definition(action)?;

        if definition.lifetime() == Lifetime::Singleton
            && let Some(existing) = self.singletons.lock().get(action)
        {
            return Ok(Arc::clone(existing));
        }

        let body = definition
            .build()
            .with_context(|| format!("failed to construct action {action}"))?;
        let instance = ActionInstance::concrete(
            &self.bus,
            action.clone(),
            definition.capabilities().cloned(),
            body,
        );

        if definition.lifetime() == Lifetime::Singleton {
            let mut singletons = self.singletons.lock();
            return Ok(Arc::clone(
                singletons.entry(action.clone()).or_insert(instance),
            ));
        }
        Ok(instance)
    }

    /// Fresh stub handle for a registered type.
    pub fn stub(&self, action: &ActionType) -> HarnessResult<StubHandle> {
        self.ensure_registered(action)?;
        Ok(StubHandle::new(action.clone()))
    }

    /// Instance standing in for `handle`'s type, carrying its declaration.
    pub fn instantiate_stub(&self, handle: &StubHandle) -> ActionRef {
        ActionInstance::stub(
            &self.bus,
            self.capabilities(handle.action_type()),
            handle.clone(),
        )
    }
}
