//! Stubs stand in for an action type without ever constructing it.

use std::sync::Arc;

use actionkit_protocol::{ActionType, HarnessError};
use anyhow::Result;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::context::CallContext;
use crate::definition::Action;

#[derive(Debug, Default)]
struct Expectation {
    returns: Option<Value>,
    calls: usize,
}

#[derive(Debug)]
struct StubState {
    action_type: ActionType,
    expectations: Mutex<IndexMap<String, Expectation>>,
}

/// Shared handle to the expectations of one stub.
///
/// Only expected methods may be invoked. An expected method returns its
/// configured literal, or `null` when none was given.
#[derive(Debug, Clone)]
pub struct StubHandle {
    state: Arc<StubState>,
}

impl StubHandle {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            state: Arc::new(StubState {
                action_type,
                expectations: Mutex::new(IndexMap::new()),
            }),
        }
    }

    pub fn action_type(&self) -> &ActionType {
        &self.state.action_type
    }

    pub fn expect_call(&self, method: impl Into<String>) -> StubExpectation {
        let method = method.into();
        self.state
            .expectations
            .lock()
            .entry(method.clone())
            .or_default();
        StubExpectation {
            handle: self.clone(),
            method,
        }
    }

    pub fn is_expected(&self, method: &str) -> bool {
        self.state.expectations.lock().contains_key(method)
    }

    pub fn returns(&self, method: &str) -> Option<Value> {
        self.state
            .expectations
            .lock()
            .get(method)
            .and_then(|e| e.returns.clone())
    }

    /// Number of times `method` was invoked through this stub.
    pub fn calls(&self, method: &str) -> usize {
        self.state
            .expectations
            .lock()
            .get(method)
            .map_or(0, |e| e.calls)
    }

    pub fn invoke(&self, method: &str, _args: &Value) -> Result<Value> {
        let mut expectations = self.state.expectations.lock();
        let Some(expectation) = expectations.get_mut(method) else {
            warn!(
                action = %self.state.action_type,
                method,
                "unexpected call on stub"
            );
            return Err(HarnessError::UnexpectedCall {
                action: self.state.action_type.clone(),
                method: method.to_owned(),
            }
            .into());
        };
        expectation.calls += 1;
        Ok(expectation.returns.clone().unwrap_or(Value::Null))
    }

    pub fn ptr_eq(&self, other: &StubHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl PartialEq for StubHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// Builder returned by [`StubHandle::expect_call`].
#[derive(Debug)]
pub struct StubExpectation {
    handle: StubHandle,
    method: String,
}

impl StubExpectation {
    pub fn then_return(self, value: Value) -> StubHandle {
        if let Some(expectation) = self.handle.state.expectations.lock().get_mut(&self.method) {
            expectation.returns = Some(value);
        }
        self.handle
    }

    pub fn handle(self) -> StubHandle {
        self.handle
    }
}

/// Body of a stub instance: routes `handle` through the stub's expectations.
pub(crate) struct StubAction {
    pub(crate) handle: StubHandle,
}

impl Action for StubAction {
    fn handle(&self, _cx: &CallContext, args: Value) -> Result<Value> {
        self.handle.invoke("handle", &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expected_call_returns_null_by_default() -> Result<()> {
        let stub = StubHandle::new(ActionType::new("Mailer"));
        stub.expect_call("handle");
        assert_eq!(stub.invoke("handle", &Value::Null)?, Value::Null);
        assert_eq!(stub.calls("handle"), 1);
        Ok(())
    }

    #[test]
    fn then_return_sets_literal() -> Result<()> {
        let stub = StubHandle::new(ActionType::new("Mailer"))
            .expect_call("handle")
            .then_return(json!({"sent": true}));
        assert_eq!(stub.invoke("handle", &Value::Null)?, json!({"sent": true}));
        assert_eq!(stub.returns("handle"), Some(json!({"sent": true})));
        Ok(())
    }

    #[test]
    fn unexpected_method_errors_loudly() {
        let stub = StubHandle::new(ActionType::new("Mailer"));
        stub.expect_call("handle");
        let err = stub.invoke("retry", &Value::Null).unwrap_err();
        let harness = err.downcast_ref::<HarnessError>();
        assert!(matches!(
            harness,
            Some(HarnessError::UnexpectedCall { method, .. }) if method == "retry"
        ));
        assert_eq!(stub.calls("retry"), 0);
    }

    #[test]
    fn clones_share_expectations() {
        let stub = StubHandle::new(ActionType::new("Mailer"));
        let clone = stub.clone();
        clone.expect_call("handle");
        assert!(stub.is_expected("handle"));
        assert!(stub.ptr_eq(&clone));
    }
}
