//! # actionkit-protocol: shared contracts for the action harness
//!
//! This crate defines the vocabulary every other actionkit crate speaks:
//! identities, capability declarations, the immutable results produced by
//! listeners, and the harness error taxonomy.
//!
//! It is intentionally dependency-light (no container, bus or listener code)
//! so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: `ActionType`, `Identity`, `HarnessId`
//! - [`capability`]: `CapabilityDeclaration` and declared-event checks with suggestions
//! - [`results`]: `Measurement`, `Profile`, `MemoryCheckpoint`, `QueryRecord`, `LogRecord`
//! - [`format`]: byte and duration formatting used by the results
//! - [`error`]: `HarnessError`, `HarnessResult`

pub mod capability;
pub mod error;
pub mod format;
pub mod ids;
pub mod results;

// Re-export the most commonly used types at the crate root.
pub use capability::{CapabilityDeclaration, EventVerb, SUGGESTION_DISTANCE, check_event};
pub use error::{HarnessError, HarnessResult};
pub use format::{MemoryUnit, format_bytes, format_duration};
pub use ids::{ActionType, HarnessId, Identity};
pub use results::{
    CheckpointRecord, LogLevel, LogRecord, Measurement, MemoryCheckpoint, Profile, QueryRecord,
};
