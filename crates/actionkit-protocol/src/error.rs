//! Error types for the action harness.

use thiserror::Error;

use crate::capability::EventVerb;
use crate::ids::ActionType;

/// Errors raised by the harness itself.
///
/// Errors produced by an action's own logic never pass through this type:
/// they travel as `anyhow::Error` and reach the caller exactly as raised.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("The action {0} is not registered with the container")]
    UnknownAction(ActionType),
    #[error("A callback is required when instrumenting with {feature}")]
    MissingCallback { feature: &'static str },
    #[error("invalid stub specification: {0}")]
    InvalidStubSpec(String),
    #[error("Events array cannot be empty")]
    EmptyDeclaration,
    #[error("Cannot {verb} event '{event}'. {hint}")]
    EventNotDeclared {
        action: ActionType,
        event: String,
        verb: EventVerb,
        hint: String,
    },
    #[error("{0} has not been executed yet")]
    NotExecuted(ActionType),
    #[error("unexpected call to {method}() on stubbed {action}")]
    UnexpectedCall { action: ActionType, method: String },
    #[error("the event bus has been shut down")]
    BusClosed,
    #[error("no action is executing on this call context")]
    NoActiveAction,
    #[error("unknown log level '{0}'")]
    InvalidLogLevel(String),
    #[error("Invalid unit: {0}. Supported units: B, KB, MB, GB, TB")]
    InvalidUnit(String),
}

/// Convenience result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
