//! Immutable results produced by the listeners.
//!
//! Every result names the action type it was captured for (`subject` or
//! `action`) and renders as a single human readable line through `Display`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HarnessError;
use crate::format::{MemoryUnit, format_bytes, format_duration};
use crate::ids::ActionType;

fn span(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or_default()
}

/// Wall-clock window of one action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub subject: ActionType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Measurement {
    pub fn duration(&self) -> Duration {
        span(self.start, self.end)
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration().as_secs_f64() * 1000.0
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} took {}", self.subject, format_duration(self.duration()))
    }
}

/// A labelled memory reading taken while an action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryCheckpoint {
    pub label: String,
    pub memory: u64,
    pub timestamp: DateTime<Utc>,
}

impl MemoryCheckpoint {
    pub fn formatted_memory(&self) -> String {
        format_bytes(self.memory as i64)
    }
}

/// A checkpoint as reported by [`Profile::records`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub label: String,
    pub memory: u64,
    pub memory_formatted: String,
    pub timestamp: DateTime<Utc>,
    /// Offset from the start of the profiled window.
    pub relative_time: TimeDelta,
}

/// Timing and memory snapshot of one action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub subject: ActionType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub start_memory: u64,
    pub end_memory: u64,
    pub peak_memory: u64,
    pub checkpoints: Vec<MemoryCheckpoint>,
}

impl Profile {
    pub fn duration(&self) -> Duration {
        span(self.start, self.end)
    }

    /// Signed delta between end and start usage, in bytes.
    pub fn memory_used(&self) -> i64 {
        self.end_memory as i64 - self.start_memory as i64
    }

    pub fn formatted_memory_used(&self) -> String {
        format_bytes(self.memory_used())
    }

    pub fn formatted_peak_memory(&self) -> String {
        format_bytes(self.peak_memory as i64)
    }

    pub fn memory_used_in(&self, unit: MemoryUnit) -> f64 {
        unit.convert(self.memory_used())
    }

    pub fn start_memory_in(&self, unit: MemoryUnit) -> f64 {
        unit.convert(self.start_memory as i64)
    }

    pub fn end_memory_in(&self, unit: MemoryUnit) -> f64 {
        unit.convert(self.end_memory as i64)
    }

    pub fn peak_memory_in(&self, unit: MemoryUnit) -> f64 {
        unit.convert(self.peak_memory as i64)
    }

    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.checkpoints
            .iter()
            .map(|checkpoint| CheckpointRecord {
                label: checkpoint.label.clone(),
                memory: checkpoint.memory,
                memory_formatted: checkpoint.formatted_memory(),
                timestamp: checkpoint.timestamp,
                relative_time: checkpoint.timestamp - self.start,
            })
            .collect()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} took {}", self.subject, format_duration(self.duration()))?;
        if self.start_memory > 0 || self.end_memory > 0 || self.peak_memory > 0 {
            write!(
                f,
                " (memory: {}, peak: {})",
                self.formatted_memory_used(),
                self.formatted_peak_memory()
            )?;
        }
        Ok(())
    }
}

/// One database query observed while an action ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub sql: String,
    pub bindings: Vec<Value>,
    /// Execution time in milliseconds, exactly as reported by the feed.
    pub duration_ms: f64,
    pub connection: String,
    pub action: Option<ActionType>,
}

impl QueryRecord {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_ms.max(0.0) / 1000.0)
    }
}

impl fmt::Display for QueryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings = Value::Array(self.bindings.clone());
        write!(
            f,
            "Query: {} | Bindings: {bindings} | Time: {}ms",
            self.sql, self.duration_ms
        )?;
        if let Some(action) = &self.action {
            write!(f, " | Action: {action}")?;
        }
        Ok(())
    }
}

/// Severity of a captured log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Alert => "alert",
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emergency" => Ok(Self::Emergency),
            "alert" => Ok(Self::Alert),
            "critical" => Ok(Self::Critical),
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "notice" => Ok(Self::Notice),
            "info" => Ok(Self::Info),
            "debug" | "trace" => Ok(Self::Debug),
            _ => Err(HarnessError::InvalidLogLevel(s.to_owned())),
        }
    }
}

/// One log message observed while an action ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub action: Option<ActionType>,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}.{}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.channel,
            self.level.as_str().to_ascii_uppercase(),
            self.message
        )?;
        if !self.context.is_empty() {
            write!(f, " {}", Value::Object(self.context.clone()))?;
        }
        Ok(())
    }
}
