//! Severity-tiered alert routing
//!
//! [`AlertRouter`] maps an [`AlertEvent`] to zero or more side-effecting
//! actions (console write, structured log write, templated email) based on
//! the per-severity configuration. Channels are injected behind narrow
//! traits; the router never constructs its own collaborators.
//!
//! Failure isolation: an exception inside any channel action is contained
//! and re-raised as a single secondary Error alert describing the failure;
//! failures while handling the secondary go straight to stderr. Events no
//! configured action handles are escalated to the stderr fallback, so no
//! alert is silently dropped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tracing::debug;

use crate::config::{AlertsConfig, EmailChannelConfig};
use crate::template::TokenSet;
use crate::{AlertEvent, Error, Result, Severity};

/// Outcome of dispatching one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// At least one configured action reported success.
    Handled,
    /// No action handled the event; the stderr fallback fired.
    Unhandled,
}

impl Dispatch {
    pub fn is_handled(&self) -> bool {
        matches!(self, Dispatch::Handled)
    }
}

/// A rendered email ready for delivery.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
}

/// Structured log writer.
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str, error: Option<&str>) -> Result<()>;
}

/// Console/stderr writer. `write_error` is the last-resort sink and is
/// therefore infallible.
pub trait ConsoleWriter: Send + Sync {
    fn write_line(&self, line: &str) -> Result<()>;
    fn write_error(&self, line: &str);
}

/// Email delivery backend.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;

    /// Backend name
    fn name(&self) -> &str;
}

// ============================================================================
// Default channel implementations
// ============================================================================

/// Log sink backed by the `tracing` macros.
#[derive(Debug, Clone, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, severity: Severity, message: &str, error: Option<&str>) -> Result<()> {
        match severity {
            Severity::Trace => tracing::trace!(error, "{message}"),
            Severity::Debug => tracing::debug!(error, "{message}"),
            Severity::Audit | Severity::Information => tracing::info!(error, "{message}"),
            Severity::Warning => tracing::warn!(error, "{message}"),
            Severity::Error => tracing::error!(error, "{message}"),
            Severity::Critical => tracing::error!(severity = "critical", error, "{message}"),
        }
        Ok(())
    }
}

/// Console writer backed by stdout/stderr.
#[derive(Debug, Clone, Default)]
pub struct StdConsole;

impl ConsoleWriter for StdConsole {
    fn write_line(&self, line: &str) -> Result<()> {
        println!("{line}");
        Ok(())
    }

    fn write_error(&self, line: &str) {
        eprintln!("{line}");
    }
}

// ============================================================================
// SMTP Backend
// ============================================================================

/// SMTP email backend via lettre.
///
/// Credentials are read from `SMTP_USERNAME`/`SMTP_PASSWORD` (or their
/// `_FILE` variants per the usual secret convention).
#[cfg(feature = "smtp")]
#[derive(Clone)]
pub struct SmtpMailer {
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
}

#[cfg(feature = "smtp")]
impl SmtpMailer {
    /// Connect to an SMTP relay over TLS.
    pub fn new(relay: &str) -> Result<Self> {
        use lettre::transport::smtp::authentication::Credentials;

        let mut builder =
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::relay(relay)
                .map_err(|e| Error::Email(format!("SMTP relay setup failed: {}", e)))?;

        if let (Some(user), Some(pass)) = (
            crate::config::get_secret("SMTP_USERNAME"),
            crate::config::get_secret("SMTP_PASSWORD"),
        ) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[cfg(feature = "smtp")]
#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        use lettre::message::header::ContentType;
        use lettre::AsyncTransport;

        let content_type = if message.is_html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        let email = lettre::Message::builder()
            .from(
                message
                    .from
                    .parse()
                    .map_err(|e| Error::Email(format!("invalid from address: {}", e)))?,
            )
            .to(message
                .to
                .parse()
                .map_err(|e| Error::Email(format!("invalid to address: {}", e)))?)
            .subject(&message.subject)
            .header(content_type)
            .body(message.body.clone())
            .map_err(|e| Error::Email(format!("failed to build email: {}", e)))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| Error::Email(format!("SMTP send failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

// ============================================================================
// Alert Router
// ============================================================================

/// Routes alerts to channels according to per-severity configuration.
///
/// Explicitly constructed and passed by reference to call sites; there is no
/// global handler registry.
pub struct AlertRouter {
    config: AlertsConfig,
    tokens: TokenSet,
    log: Arc<dyn LogSink>,
    console: Arc<dyn ConsoleWriter>,
    email: Option<Arc<dyn EmailSender>>,
}

impl AlertRouter {
    pub fn new(
        config: AlertsConfig,
        tokens: TokenSet,
        log: Arc<dyn LogSink>,
        console: Arc<dyn ConsoleWriter>,
    ) -> Self {
        Self {
            config,
            tokens,
            log,
            console,
            email: None,
        }
    }

    /// Attach an email delivery backend.
    pub fn with_email(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = Some(email);
        self
    }

    /// Route one alert through its configured actions.
    ///
    /// Never returns an error: channel failures are contained and re-raised
    /// as secondary Error alerts, and unhandled events fall through to the
    /// stderr fallback.
    pub async fn dispatch(&self, event: &AlertEvent) -> Dispatch {
        let handled = match event.severity {
            Severity::Audit => self.audit_action(event).await,
            Severity::Trace | Severity::Debug | Severity::Information | Severity::Warning => {
                self.log_tier_action(event).await
            }
            Severity::Error | Severity::Critical => self.escalation_actions(event).await,
        };

        if handled {
            Dispatch::Handled
        } else {
            self.fallback(event);
            Dispatch::Unhandled
        }
    }

    /// Audit severity: single console write.
    async fn audit_action(&self, event: &AlertEvent) -> bool {
        let line = match &event.error {
            Some(err) => format!("[audit] {} ({})", event.message, err),
            None => format!("[audit] {}", event.message),
        };
        match self.console.write_line(&line) {
            Ok(()) => true,
            Err(e) => {
                self.raise_channel_failure("console", &e).await;
                false
            }
        }
    }

    /// Trace/Debug/Information/Warning: single gated log write.
    async fn log_tier_action(&self, event: &AlertEvent) -> bool {
        if !self.config.is_enabled(event.severity) {
            debug!(severity = %event.severity, "alert severity not configured");
            return false;
        }
        match self
            .log
            .log(event.severity, &event.message, event.error.as_deref())
        {
            Ok(()) => true,
            Err(e) => {
                self.raise_channel_failure("log", &e).await;
                false
            }
        }
    }

    /// Error/Critical: log write, then templated email. Actions are
    /// independent; the event counts as handled only if the email went out.
    async fn escalation_actions(&self, event: &AlertEvent) -> bool {
        if !self.config.is_enabled(event.severity) {
            debug!(severity = %event.severity, "alert severity not configured");
            return false;
        }

        if let Err(e) = self
            .log
            .log(event.severity, &event.message, event.error.as_deref())
        {
            self.raise_channel_failure("log", &e).await;
        }

        let Some(email_config) = self.config.email_channel(event.severity) else {
            return false;
        };
        let Some(sender) = &self.email else {
            debug!(severity = %event.severity, "no email backend attached");
            return false;
        };

        let message = self.render_email(email_config, event);
        match sender.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                self.raise_channel_failure(sender.name(), &e).await;
                false
            }
        }
    }

    fn render_email(&self, config: &EmailChannelConfig, event: &AlertEvent) -> EmailMessage {
        let tokens = self
            .tokens
            .with_event(&event.message, event.error.as_deref());
        EmailMessage {
            from: config.from.clone(),
            to: config.to.clone(),
            subject: tokens.render(&config.subject_template),
            body: tokens.render(&config.body_template),
            is_html: config.is_html,
        }
    }

    /// Contain a channel failure by raising a secondary Error alert.
    ///
    /// The secondary takes the Error tier actions inline rather than going
    /// back through [`AlertRouter::dispatch`]; its own channel failures are
    /// written straight to stderr, so a broken channel can never loop.
    async fn raise_channel_failure(&self, channel: &str, failure: &Error) {
        let secondary = AlertEvent::new(
            Severity::Error,
            format!("alert channel '{channel}' failed"),
        )
        .with_error(failure.to_string());

        let mut handled = false;
        if self.config.is_enabled(Severity::Error) {
            if let Err(e) = self.log.log(
                Severity::Error,
                &secondary.message,
                secondary.error.as_deref(),
            ) {
                self.console
                    .write_error(&format!("alert channel 'log' failed: {e}"));
            }

            if let (Some(email_config), Some(sender)) =
                (self.config.email_channel(Severity::Error), &self.email)
            {
                let message = self.render_email(email_config, &secondary);
                match sender.send(&message).await {
                    Ok(()) => handled = true,
                    Err(e) => self.console.write_error(&format!(
                        "alert channel '{}' failed: {e}",
                        sender.name()
                    )),
                }
            }
        }

        if !handled {
            self.fallback(&secondary);
        }
    }

    /// Last-resort escalation: write timestamp, message and error to stderr.
    fn fallback(&self, event: &AlertEvent) {
        let raised = event.raised_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = match &event.error {
            Some(err) => format!(
                "UNHANDLED ALERT [{}] {} {}: {}",
                event.severity, raised, event.message, err
            ),
            None => format!(
                "UNHANDLED ALERT [{}] {} {}",
                event.severity, raised, event.message
            ),
        };
        self.console.write_error(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeverityConfig, SmsChannelConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(Severity, String)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn calls(&self) -> Vec<(Severity, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LogSink for RecordingSink {
        fn log(&self, severity: Severity, message: &str, _error: Option<&str>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((severity, message.to_string()));
            if self.fail {
                Err(Error::Channel("log sink unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingConsole {
        lines: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl RecordingConsole {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl ConsoleWriter for RecordingConsole {
        fn write_line(&self, line: &str) -> Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn write_error(&self, line: &str) {
            self.errors.lock().unwrap().push(line.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
        fail: bool,
    }

    impl RecordingMailer {
        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmailSender for RecordingMailer {
        async fn send(&self, message: &EmailMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            if self.fail {
                Err(Error::Email("smtp refused connection".into()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn email_config(to: &str) -> EmailChannelConfig {
        EmailChannelConfig {
            enabled: true,
            to: to.into(),
            from: "backupd@example.com".into(),
            subject_template: "[%APP%] %MSG%".into(),
            body_template: "%MSG%\n%EX%".into(),
            is_html: false,
        }
    }

    fn tokens() -> TokenSet {
        let mut set = TokenSet::new();
        set.insert("%APP%", "backupd");
        set
    }

    struct Harness {
        sink: Arc<RecordingSink>,
        console: Arc<RecordingConsole>,
        mailer: Arc<RecordingMailer>,
        router: AlertRouter,
    }

    fn harness(config: AlertsConfig, sink: RecordingSink, mailer: RecordingMailer) -> Harness {
        let sink = Arc::new(sink);
        let console = Arc::new(RecordingConsole::default());
        let mailer = Arc::new(mailer);
        let router = AlertRouter::new(config, tokens(), sink.clone(), console.clone())
            .with_email(mailer.clone());
        Harness {
            sink,
            console,
            mailer,
            router,
        }
    }

    #[tokio::test]
    async fn test_audit_writes_console_and_is_handled() {
        let h = harness(
            AlertsConfig::default(),
            RecordingSink::default(),
            RecordingMailer::default(),
        );

        let event = AlertEvent::new(Severity::Audit, "user logged in");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Handled);
        assert_eq!(h.console.lines(), vec!["[audit] user logged in"]);
        assert!(h.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_information_never_touches_sink() {
        // Information severity absent from config: no log write, falls
        // through to the stderr fallback.
        let h = harness(
            AlertsConfig::default(),
            RecordingSink::default(),
            RecordingMailer::default(),
        );

        let event = AlertEvent::new(Severity::Information, "cache warmed");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Unhandled);
        assert!(h.sink.calls().is_empty());

        // The fallback line carries the raise timestamp.
        let errors = h.console.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("UNHANDLED ALERT [information]"));
        assert!(errors[0].contains(&event.raised_at.to_rfc3339_opts(SecondsFormat::Secs, true)));
        assert!(errors[0].ends_with("cache warmed"));
    }

    #[tokio::test]
    async fn test_enabled_information_is_logged_and_handled() {
        let config = AlertsConfig {
            information: Some(SeverityConfig::enabled()),
            ..Default::default()
        };
        let h = harness(config, RecordingSink::default(), RecordingMailer::default());

        let event = AlertEvent::new(Severity::Information, "cache warmed");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Handled);
        assert_eq!(
            h.sink.calls(),
            vec![(Severity::Information, "cache warmed".to_string())]
        );
        assert!(h.console.errors().is_empty());
    }

    #[tokio::test]
    async fn test_log_failure_raises_secondary_alert_without_looping() {
        let config = AlertsConfig {
            warning: Some(SeverityConfig::enabled()),
            error: Some(SeverityConfig::enabled()),
            ..Default::default()
        };
        let h = harness(config, RecordingSink::failing(), RecordingMailer::default());

        let event = AlertEvent::new(Severity::Warning, "disk nearly full");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Unhandled);

        // Original warning write plus exactly one secondary Error write; the
        // secondary's own log failure goes straight to stderr.
        let calls = h.sink.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, Severity::Warning);
        assert_eq!(calls[1].0, Severity::Error);
        assert!(calls[1].1.contains("alert channel 'log' failed"));

        let errors = h.console.errors();
        assert!(errors.iter().any(|e| e.contains("log sink unavailable")));
        assert!(errors
            .iter()
            .any(|e| e.starts_with("UNHANDLED ALERT [warning]") && e.contains("disk nearly full")));
    }

    #[tokio::test]
    async fn test_error_with_email_enabled_is_handled() {
        let config = AlertsConfig {
            error: Some(SeverityConfig::with_email(email_config("ops@example.com"))),
            ..Default::default()
        };
        let h = harness(config, RecordingSink::default(), RecordingMailer::default());

        let event = AlertEvent::new(Severity::Error, "disk full").with_error("ENOSPC");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Handled);

        assert_eq!(h.sink.calls(), vec![(Severity::Error, "disk full".to_string())]);

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@example.com");
        assert_eq!(sent[0].subject, "[backupd] disk full");
        assert_eq!(sent[0].body, "disk full\nENOSPC");
        assert!(h.console.errors().is_empty());
    }

    #[tokio::test]
    async fn test_error_with_email_disabled_logs_then_falls_through() {
        let mut email = email_config("ops@example.com");
        email.enabled = false;
        let config = AlertsConfig {
            error: Some(SeverityConfig::with_email(email)),
            ..Default::default()
        };
        let h = harness(config, RecordingSink::default(), RecordingMailer::default());

        let event = AlertEvent::new(Severity::Error, "disk full");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Unhandled);

        // Log write still occurs, then the stderr fallback fires.
        assert_eq!(h.sink.calls(), vec![(Severity::Error, "disk full".to_string())]);
        assert!(h.mailer.sent().is_empty());
        let errors = h.console.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("UNHANDLED ALERT [error]"));
        assert!(errors[0].ends_with("disk full"));
    }

    #[tokio::test]
    async fn test_critical_email_failure_is_isolated() {
        let config = AlertsConfig {
            error: Some(SeverityConfig::enabled()),
            critical: Some(SeverityConfig::with_email(email_config("oncall@example.com"))),
            ..Default::default()
        };
        let h = harness(config, RecordingSink::default(), RecordingMailer::failing());

        let event = AlertEvent::new(Severity::Critical, "database unreachable");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Unhandled);

        // The log write was attempted (at Critical's own level) regardless of
        // the email outcome, and a secondary Error alert describes the
        // failure.
        let calls = h.sink.calls();
        assert_eq!(calls[0], (Severity::Critical, "database unreachable".to_string()));
        assert!(calls
            .iter()
            .any(|(s, m)| *s == Severity::Error && m.contains("'recording' failed")));

        // The email was attempted exactly once.
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_critical_uses_its_own_email_settings() {
        let config = AlertsConfig {
            error: Some(SeverityConfig::with_email(email_config("ops@example.com"))),
            critical: Some(SeverityConfig {
                enabled: true,
                email: Some(email_config("oncall@example.com")),
                sms: Some(SmsChannelConfig {
                    enabled: true,
                    to: "+15550100".into(),
                    from: "+15550199".into(),
                }),
            }),
            ..Default::default()
        };
        let h = harness(config, RecordingSink::default(), RecordingMailer::default());

        let event = AlertEvent::new(Severity::Critical, "database unreachable");
        assert_eq!(h.router.dispatch(&event).await, Dispatch::Handled);

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "oncall@example.com");
    }

    #[test]
    fn test_dispatch_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let h = harness(
            AlertsConfig::default(),
            RecordingSink::default(),
            RecordingMailer::default(),
        );
        let event = AlertEvent::new(Severity::Audit, "spawnable");
        assert_send(h.router.dispatch(&event));
    }

    #[tokio::test]
    async fn test_error_without_email_backend_falls_through() {
        let config = AlertsConfig {
            error: Some(SeverityConfig::with_email(email_config("ops@example.com"))),
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let console = Arc::new(RecordingConsole::default());
        let router = AlertRouter::new(config, tokens(), sink.clone(), console.clone());

        let event = AlertEvent::new(Severity::Error, "disk full");
        assert_eq!(router.dispatch(&event).await, Dispatch::Unhandled);
        assert_eq!(sink.calls().len(), 1);
        assert_eq!(console.errors().len(), 1);
    }
}
