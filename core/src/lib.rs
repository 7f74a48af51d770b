//! Core library for runguard
//!
//! This crate provides the single-instance execution guard, the bounded
//! retry policy, and the severity-tiered alert router with its channel
//! traits, shared across all runguard components.

pub mod alerts;
pub mod config;
pub mod error;
pub mod lock;
pub mod retry;
pub mod template;
pub mod types;

// Re-exports
pub use alerts::{
    AlertRouter, ConsoleWriter, Dispatch, EmailMessage, EmailSender, LogSink, StdConsole,
    TracingLogSink,
};
#[cfg(feature = "smtp")]
pub use alerts::SmtpMailer;
pub use config::{AlertsConfig, Config, EmailChannelConfig, SeverityConfig, SmsChannelConfig};
pub use error::{Error, Result};
pub use lock::{lock_name, LockSentinel, SingleInstance};
pub use retry::RetryPolicy;
pub use template::TokenSet;
pub use types::{AlertEvent, AppIdentity, CallerContext, RunOutcome, Severity};
