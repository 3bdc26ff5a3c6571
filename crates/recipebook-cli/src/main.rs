//! recipebook - command-line access to recipebook account sessions.
//!
//! Signs in to the identity provider, keeps the session across runs and
//! reports when it expires.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use recipebook_core::{AuthClient, AuthError, Config, ReqwestTransport, Session, SessionManager};

// ============================================================================
// Constants
// ============================================================================

const USAGE: &str = "\
Usage: recipebook [--log-file] <command>

Commands:
  signup [email]   Create an account and sign in
  login [email]    Sign in with an existing account
  logout           End the current session
  status           Show the current session
  watch            Follow the current session until it ends (Ctrl-C to stop)";

/// Log file name prefix in the cache directory
const LOG_FILE_PREFIX: &str = "recipebook.log";

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    SignUp(Option<String>),
    LogIn(Option<String>),
    LogOut,
    Status,
    Watch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    command: Command,
    log_file: bool,
}

/// How a command finished, reported as the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    /// The provider or transport refused the credentials (exit status 1).
    AuthFailed,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => ExitCode::SUCCESS,
            Outcome::AuthFailed => ExitCode::FAILURE,
        }
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut log_file = false;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--log-file" => log_file = true,
            flag if flag.starts_with('-') => bail!("Unknown option: {}", flag),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("signup") => Command::SignUp(positional.next()),
        Some("login") => Command::LogIn(positional.next()),
        Some("logout") => Command::LogOut,
        Some("status") | None => Command::Status,
        Some("watch") => Command::Watch,
        Some(other) => bail!("Unknown command: {}", other),
    };
    if let Some(extra) = positional.next() {
        bail!("Unexpected argument: {}", extra);
    }

    Ok(Args { command, log_file })
}

// ============================================================================
// Setup
// ============================================================================

/// Initialize the tracing subscriber for logging.
/// Logs go to stderr, or to a daily file in `log_dir` when given.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            return Ok(ExitCode::from(2));
        }
    };

    let loaded = Config::load();
    let log_dir = if args.log_file {
        loaded.as_ref().ok().and_then(|c| c.cache_dir().ok())
    } else {
        None
    };
    let _guard = init_tracing(log_dir.as_deref());

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            let mut config = Config::default();
            config.apply_env(|name| std::env::var(name).ok());
            config
        }
    };
    debug!(storage = ?config.storage, locale = ?config.locale, "Config loaded");

    let sessions = SessionManager::new(
        config.session_store()?,
        Arc::new(|| println!("Signed out. Run `recipebook login` to sign in again.")),
    );
    let restored = sessions.restore();
    debug!(restored, "Startup restore finished");

    // Returned rather than exiting so `_guard` flushes the log file first.
    let outcome = match args.command {
        Command::Status => {
            print_status(sessions.current().as_ref());
            Outcome::Done
        }
        Command::LogOut => {
            sessions.logout();
            Outcome::Done
        }
        Command::SignUp(email) => sign_in(&config, sessions, email, true).await?,
        Command::LogIn(email) => sign_in(&config, sessions, email, false).await?,
        Command::Watch => {
            watch(&sessions).await;
            Outcome::Done
        }
    };

    Ok(outcome.into())
}

// ============================================================================
// Commands
// ============================================================================

async fn sign_in(
    config: &Config,
    sessions: SessionManager,
    email: Option<String>,
    create: bool,
) -> Result<Outcome> {
    let transport = Arc::new(ReqwestTransport::new()?);
    let client = AuthClient::from_config(config, transport, sessions)
        .context("Set RECIPEBOOK_API_KEY or api_key in config.json")?;

    let email = match email {
        Some(email) => email,
        None => prompt_email(config.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("\nAuthenticating...");
    let result = if create {
        client.sign_up(&email, &password).await
    } else {
        client.log_in(&email, &password).await
    };

    match result {
        Ok(session) => {
            if let Err(e) = Config::remember_email(&session.email) {
                warn!(error = %e, "Failed to save config");
            }
            info!(user_id = %session.user_id, "Signed in");
            print_status(Some(&session));
            Ok(Outcome::Done)
        }
        Err(e) => Ok(report_auth_failure(&e)),
    }
}

fn report_auth_failure(err: &AuthError) -> Outcome {
    if let AuthError::Transport { detail, .. } = err {
        debug!(%detail, "Transport failure detail");
    }
    eprintln!("{}", err);
    Outcome::AuthFailed
}

async fn watch(sessions: &SessionManager) {
    if !sessions.is_authenticated() {
        println!("Not signed in.");
        return;
    }

    let mut changes = Box::pin(sessions.changes());
    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(Some(session)) => print_status(Some(&session)),
                Some(None) | None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

fn prompt_email(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last) {
        (false, _) => Ok(input.to_string()),
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("Email is required"),
    }
}

fn print_status(session: Option<&Session>) {
    match session {
        Some(session) => println!(
            "Signed in as {} (expires {}, {} minutes left)",
            session.email,
            session.token_expires_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            session.minutes_until_expiry()
        ),
        None => println!("Not signed in."),
    }
}

// ============================================================================
// Tests
// ============================================================================
