//! `only` selection for plain runs of an action, outside any harness.

use actionkit_protocol::{ActionType, HarnessResult};
use anyhow::Result;
use serde_json::Value;

use crate::context::{CallContext, OnlyGuard, ScopeGuard};
use crate::stub::StubHandle;

/// Keeps an only guard on its context until dropped.
#[derive(Debug)]
pub struct Within {
    root: ActionType,
    guard: Option<OnlyGuard>,
    scope: ScopeGuard,
}

impl Within {
    pub(crate) fn new<I, S>(cx: &CallContext, root: ActionType, allowed: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ActionType>,
    {
        let container = cx.container();
        container.ensure_registered(&root)?;
        let allowed = allowed
            .into_iter()
            .map(|action| {
                let action = action.into();
                container.ensure_registered(&action)?;
                Ok(action)
            })
            .collect::<HarnessResult<Vec<ActionType>>>()?;

        let scope = cx.enter_scope(format!("within {root}"));
        let guard = (!allowed.is_empty()).then(|| {
            let guard = OnlyGuard::new(root.clone(), allowed);
            scope.guard_only(guard.clone());
            guard
        });
        Ok(Self { root, guard, scope })
    }

    pub fn root(&self) -> &ActionType {
        &self.root
    }

    pub fn handle(&self, args: Value) -> Result<Value> {
        self.scope.context().call(&self.root, args)
    }

    pub fn stub(&self, action: &ActionType) -> Option<StubHandle> {
        self.guard
            .as_ref()
            .and_then(|guard| guard.created_stub(action))
    }

    pub fn stubs(&self) -> Vec<StubHandle> {
        self.guard
            .as_ref()
            .map(OnlyGuard::created_stubs)
            .unwrap_or_default()
    }
}
