//! # actionkit-container: resolution, call frames and scoped overrides
//!
//! The container holds immutable [`ActionDefinition`]s. Everything that
//! changes per harness invocation lives on a [`CallContext`] instead: a stack
//! of running frames, a stack of scope layers (stubs, interceptions and
//! `only` guards) and the relay ledger used by event propagation.
//!
//! ## Module Overview
//!
//! - [`definition`]: the `Action` trait and `ActionDefinition`
//! - [`registry`]: `Container`, the definition registry
//! - [`instance`]: `ActionInstance`: identity, events, forwarding, disposal
//! - [`context`]: `CallContext`, `ScopeGuard`, `OnlyGuard`
//! - [`stub`]: `StubHandle` expectations
//! - [`within`]: `Within`, an only guard for plain runs

pub mod context;
pub mod definition;
pub mod instance;
pub mod registry;
pub mod stub;
pub mod within;

pub use context::{CallContext, OnlyGuard, Resolution, ScopeGuard};
pub use definition::{Action, ActionDefinition, ActionFactory, Lifetime};
pub use instance::{ActionInstance, ActionRef, InstanceKind};
pub use registry::Container;
pub use stub::{StubExpectation, StubHandle};
pub use within::Within;
