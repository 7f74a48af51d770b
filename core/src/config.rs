//! Configuration management
//!
//! Alert routing is configured once at startup and treated as read-only for
//! the process lifetime. A missing severity table means "not configured" and
//! behaves the same as `enabled = false`.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Severity};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Application identity overrides (name/version)
    #[serde(default)]
    pub app: Option<AppSection>,

    /// Alert routing configuration
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Application identity section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Per-severity alert routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub audit: Option<SeverityConfig>,
    #[serde(default)]
    pub trace: Option<SeverityConfig>,
    #[serde(default)]
    pub debug: Option<SeverityConfig>,
    #[serde(default)]
    pub information: Option<SeverityConfig>,
    #[serde(default)]
    pub warning: Option<SeverityConfig>,
    #[serde(default)]
    pub error: Option<SeverityConfig>,
    #[serde(default)]
    pub critical: Option<SeverityConfig>,
}

impl AlertsConfig {
    /// Configuration for a severity, if present.
    pub fn severity(&self, severity: Severity) -> Option<&SeverityConfig> {
        match severity {
            Severity::Audit => self.audit.as_ref(),
            Severity::Trace => self.trace.as_ref(),
            Severity::Debug => self.debug.as_ref(),
            Severity::Information => self.information.as_ref(),
            Severity::Warning => self.warning.as_ref(),
            Severity::Error => self.error.as_ref(),
            Severity::Critical => self.critical.as_ref(),
        }
    }

    /// Whether a severity is configured and enabled.
    pub fn is_enabled(&self, severity: Severity) -> bool {
        self.severity(severity).map(|c| c.enabled).unwrap_or(false)
    }

    /// Email channel for a severity, only if both the severity and the
    /// channel itself are enabled.
    pub fn email_channel(&self, severity: Severity) -> Option<&EmailChannelConfig> {
        self.severity(severity)
            .filter(|c| c.enabled)
            .and_then(|c| c.email.as_ref())
            .filter(|e| e.enabled)
    }
}

/// Configuration for one alert severity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub email: Option<EmailChannelConfig>,
    /// Parsed for shape fidelity with the original configuration tree;
    /// no SMS delivery action exists in the router.
    #[serde(default)]
    pub sms: Option<SmsChannelConfig>,
}

impl SeverityConfig {
    /// Severity enabled with no channels beyond the log sink.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            email: None,
            sms: None,
        }
    }

    /// Severity enabled with an email channel.
    pub fn with_email(email: EmailChannelConfig) -> Self {
        Self {
            enabled: true,
            email: Some(email),
            sms: None,
        }
    }
}

/// Email channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub to: String,
    pub from: String,
    #[serde(default = "default_subject_template")]
    pub subject_template: String,
    #[serde(default = "default_body_template")]
    pub body_template: String,
    #[serde(default)]
    pub is_html: bool,
}

/// SMS channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub to: String,
    pub from: String,
}

fn default_true() -> bool {
    true
}

fn default_subject_template() -> String {
    "[%APP% on %MN%] %MSG%".to_string()
}

fn default_body_template() -> String {
    "Application: %APP%\nMachine: %MN%\nUser: %USER%\n\n%MSG%\n\n%EX%".to_string()
}

impl Config {
    /// Load configuration from file, or fall back to defaults
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Load from configuration file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Get secret from environment variable or file
///
/// Supports both direct environment variables and file-based secrets
/// (Docker/Kubernetes pattern). If `VAR_NAME` is not found, tries
/// `VAR_NAME_FILE` which should point to a file containing the secret.
pub fn get_secret(var_name: &str) -> Option<String> {
    // Try environment variable first
    if let Ok(value) = std::env::var(var_name) {
        return Some(value);
    }

    // Try file-based secret (Docker secrets / Kubernetes)
    let file_var = format!("{}_FILE", var_name);
    if let Ok(path) = std::env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }

    None
}
