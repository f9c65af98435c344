//! croupier - command-line access to a casino account session.
//!
//! Logs in, keeps the session's credentials in the configured store, and
//! issues authenticated requests against the backend. Expired credentials
//! are renewed transparently; when renewal fails the session ends and a
//! fresh `login` is required.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use croupier_core::{ApiRequest, Config, SessionError, SessionManager, SessionState};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Prefix for daily-rolled log files in the data directory
const LOG_FILE_PREFIX: &str = "croupier.log";

const USAGE: &str = "\
Usage: croupier <command> [args]

Commands:
  login [identifier] [--2fa CODE]   Log in (prompts for password)
  register <email> <username>       Create an account and log in
  logout                            End the session and forget credentials
  status                            Show the current session
  get <path>                        GET an API path with the session
  post <path> [json]                POST an API path with the session

Environment:
  CROUPIER_API_URL                  Backend base URL
  CROUPIER_CREDENTIAL_BACKEND       keyring | file | memory
  CROUPIER_STORE_PASSPHRASE         Key for the file backend
  RUST_LOG                          Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when a log directory is available, to a
/// daily-rolling file. The returned guard must outlive logging.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Report session transitions the way a UI would observe them.
async fn watch_session(mut rx: watch::Receiver<SessionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        if state == SessionState::Expired {
            warn!("Session expired");
        } else {
            info!(state = state.label(), "Session state");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    let _log_guard = init_tracing(config.data_dir().ok().as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let manager = SessionManager::from_config(&config)?;
    manager
        .restore()
        .await
        .context("Failed to read stored credentials")?;
    tokio::spawn(watch_session(manager.subscribe()));

    let result = match command {
        "login" => login(&manager, &mut config, &args[1..]).await,
        "register" => register(&manager, &args[1..]).await,
        "logout" => logout(&manager).await,
        "status" => {
            status(&manager);
            Ok(())
        }
        "get" => {
            let path = args.get(1).context("get needs a path")?;
            request(&manager, ApiRequest::get(path.as_str())).await
        }
        "post" => {
            let path = args.get(1).context("post needs a path")?;
            let body = match args.get(2) {
                Some(raw) => serde_json::from_str(raw).context("Body is not valid JSON")?,
                None => serde_json::json!({}),
            };
            request(&manager, ApiRequest::post(path.as_str(), body)).await
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };

    if let Err(e) = &result {
        if let Some(SessionError::Expired { .. }) = e.downcast_ref::<SessionError>() {
            eprintln!("Your session has expired. Run `croupier login` to continue.");
        }
    }
    result
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(manager: &SessionManager, config: &mut Config, args: &[String]) -> Result<()> {
    let mut identifier = None;
    let mut two_factor = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--2fa" => two_factor = Some(iter.next().context("--2fa needs a code")?.clone()),
            other => identifier = Some(other.to_string()),
        }
    }

    let identifier = match identifier.or_else(|| config.last_identifier.clone()) {
        Some(id) => id,
        None => prompt("Email or username: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", identifier))?;

    let user = manager
        .login(&identifier, &password, two_factor.as_deref())
        .await?;
    println!(
        "Logged in as {}",
        user.as_ref().map(|u| u.display_name()).unwrap_or(&identifier)
    );

    config.last_identifier = Some(identifier);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

async fn register(manager: &SessionManager, args: &[String]) -> Result<()> {
    let (Some(email), Some(username)) = (args.first(), args.get(1)) else {
        bail!("register needs <email> <username>");
    };
    let password = rpassword::prompt_password("Choose a password: ")?;
    let confirm = rpassword::prompt_password("Repeat password: ")?;
    if password != confirm {
        bail!("Passwords do not match");
    }
    manager.register(email, username, &password).await?;
    println!("Account {} created, logged in", username);
    Ok(())
}

async fn logout(manager: &SessionManager) -> Result<()> {
    manager.logout().await?;
    println!("Logged out");
    Ok(())
}

fn status(manager: &SessionManager) {
    println!("Session: {}", manager.state().label());
    if let Some(user) = manager.user() {
        println!("User:    {}", user.display_name());
    }
    if let Some(remaining) = manager.time_until_expiry() {
        println!("Access credential expires in {}s", remaining.num_seconds().max(0));
    }
}

async fn request(manager: &SessionManager, request: ApiRequest) -> Result<()> {
    let response = manager.send(request).await?;
    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}
