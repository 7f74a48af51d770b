//! Shared types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Audit,
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Short stable label for logs and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Audit => "audit",
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Information => "information",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional call-site diagnostics attached to an alert.
///
/// Purely informational; dispatch behavior never depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub member: String,
    pub file: String,
    pub line: u32,
}

impl CallerContext {
    pub fn new(member: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            member: member.into(),
            file: file.into(),
            line,
        }
    }
}

/// A single alert to be routed through the configured channels.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub severity: Severity,
    pub message: String,
    /// Rendered description of an associated error, if any.
    pub error: Option<String>,
    pub context: Option<CallerContext>,
    pub raised_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            error: None,
            context: None,
            raised_at: Utc::now(),
        }
    }

    /// Attach an associated error description.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach call-site diagnostics.
    pub fn with_context(mut self, context: CallerContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Application identity supplied by the environment.
///
/// Used only to derive the lock name and the fixed template tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Display string for console titles and log headers.
    pub fn display(&self) -> String {
        format!("{} v{}", self.name, self.version)
    }
}

/// Outcome of a guarded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The operation ran to completion under the lock.
    Completed,
    /// Another instance held the lock; the operation did not run.
    Skipped,
    /// The operation started but was cancelled; the lock was released.
    Cancelled,
}

impl RunOutcome {
    /// Whether the guarded operation was started.
    pub fn ran(&self) -> bool {
        matches!(self, RunOutcome::Completed | RunOutcome::Cancelled)
    }
}
