//! runguard CLI
//!
//! Runs an arbitrary command under the single-instance guard and routes
//! process alerts through the configured channels.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runguard_core::{
    AlertEvent, AlertRouter, AppIdentity, Config, Error, RunOutcome, Severity, SingleInstance,
    StdConsole, TokenSet, TracingLogSink,
};

/// sysexits EX_TEMPFAIL: another instance held the lock, try again later.
const EXIT_SKIPPED: i32 = 75;
/// Conventional code for termination by SIGINT.
const EXIT_CANCELLED: i32 = 130;

/// Run a command while holding a machine-wide single-instance lock
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Application name used to derive the lock identity
    #[arg(short, long, env = "RUNGUARD_NAME")]
    name: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Directory holding the lock sentinel file (defaults to the OS temp dir)
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Lock acquisition timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// SMTP relay host for email alerts (requires the `smtp` build feature)
    #[arg(long, env = "RUNGUARD_SMTP_RELAY")]
    smtp_relay: Option<String>,

    /// Command to run under the guard
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runguard=debug".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    let app = identity(&args, &config);
    info!(app = %app.display(), "starting runguard");

    let router = build_router(&args, &config)?;

    let mut guard = match &args.lock_dir {
        Some(dir) => SingleInstance::with_lock_dir(&app, dir),
        None => SingleInstance::new(&app),
    };
    guard = guard.with_timeout(std::time::Duration::from_millis(args.timeout_ms));

    // Ctrl-C aborts the guarded command but still releases the lock.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let exit_code: Mutex<Option<i32>> = Mutex::new(None);
    let outcome = guard
        .run_once_async(
            || run_command(&router, &args.command, &exit_code),
            cancel,
        )
        .await;

    match outcome {
        Ok(outcome) => {
            match outcome {
                RunOutcome::Completed => {}
                RunOutcome::Cancelled => warn!("guarded command cancelled"),
                RunOutcome::Skipped => {
                    warn!(lock = %guard.name(), "another instance is already running; skipping");
                }
            }
            std::process::exit(exit_code_for(outcome, *exit_code.lock().unwrap()));
        }
        Err(e) => {
            let event = AlertEvent::new(Severity::Critical, "single-instance guard failed")
                .with_error(e.to_string());
            router.dispatch(&event).await;
            Err(e.into())
        }
    }
}

/// Map the guard outcome to the process exit code. Skipped and cancelled
/// runs get distinct codes so callers can tell them apart from a successful
/// guarded command.
fn exit_code_for(outcome: RunOutcome, command_code: Option<i32>) -> i32 {
    match outcome {
        RunOutcome::Completed => command_code.unwrap_or(0),
        RunOutcome::Cancelled => EXIT_CANCELLED,
        RunOutcome::Skipped => EXIT_SKIPPED,
    }
}

/// Resolve the application identity from args, config, and crate metadata.
fn identity(args: &Args, config: &Config) -> AppIdentity {
    let app_section = config.app.as_ref();
    let name = args
        .name
        .clone()
        .or_else(|| app_section.and_then(|a| a.name.clone()))
        .unwrap_or_else(|| "runguard".to_string());
    let version = app_section
        .and_then(|a| a.version.clone())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    AppIdentity::new(name, version)
}

fn build_router(args: &Args, config: &Config) -> anyhow::Result<AlertRouter> {
    let app = identity(args, config);
    let tokens = TokenSet::fixed(&app);
    let router = AlertRouter::new(
        config.alerts.clone(),
        tokens,
        Arc::new(TracingLogSink),
        Arc::new(StdConsole),
    );

    #[cfg(feature = "smtp")]
    if let Some(relay) = &args.smtp_relay {
        let mailer = runguard_core::SmtpMailer::new(relay)?;
        return Ok(router.with_email(Arc::new(mailer)));
    }

    #[cfg(not(feature = "smtp"))]
    if args.smtp_relay.is_some() {
        warn!("--smtp-relay ignored: built without the `smtp` feature");
    }

    Ok(router)
}

/// Run the command and report its outcome through the alert router.
async fn run_command(
    router: &AlertRouter,
    command: &[String],
    exit_code: &Mutex<Option<i32>>,
) -> runguard_core::Result<()> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| Error::Config("no command given".into()))?;

    info!(command = %program, "starting guarded command");

    let status = match tokio::process::Command::new(program).args(rest).status().await {
        Ok(status) => status,
        Err(e) => {
            let event = AlertEvent::new(
                Severity::Critical,
                format!("failed to start command '{}'", program),
            )
            .with_error(e.to_string());
            router.dispatch(&event).await;
            return Err(e.into());
        }
    };

    *exit_code.lock().unwrap() = status.code();

    if status.success() {
        let event = AlertEvent::new(
            Severity::Information,
            format!("command '{}' completed", program),
        );
        router.dispatch(&event).await;
    } else {
        let event = AlertEvent::new(
            Severity::Error,
            format!("command '{}' exited with {}", program, status),
        )
        .with_error(status.to_string());
        router.dispatch(&event).await;
    }

    Ok(())
}
