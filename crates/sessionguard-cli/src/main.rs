//! sessionguard - command-line front end for an authenticated session.
//!
//! The access credential only lives for one process, so every command after
//! `login` starts without one and renews it from the stored refresh credential.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sessionguard_core::api::{ApiError, SessionClient};
use sessionguard_core::auth::{CredentialStore, SessionController};
use sessionguard_core::config::Config;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for a daily-rolling log file, in addition to stderr
const ENV_LOG_DIR: &str = "SESSIONGUARD_LOG_DIR";

const LOG_FILE_PREFIX: &str = "sessionguard.log";

const USAGE: &str = "Usage: sessionguard <command>

Commands:
  login [email]   Log in and store the refresh credential
  whoami          Show the logged-in identity
  status          Show configuration and stored credential state
  logout          End the session and clear stored credentials";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR).ok().map(PathBuf::from) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env()?;

    let credentials = Arc::new(CredentialStore::new(config.refresh_store()?));
    let client = SessionClient::new(config.client_options(), credentials)?;
    let controller = SessionController::new(
        client,
        Arc::new(|| eprintln!("Session expired. Run `sessionguard login` to sign in again.")),
    );

    match command.as_str() {
        "login" => login(&controller, &mut config, args.get(1).cloned()).await,
        "whoami" => whoami(&controller).await,
        "status" => status(&controller, &config),
        "logout" => {
            controller.logout().await;
            println!("Logged out");
            Ok(())
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

async fn login(
    controller: &SessionController,
    config: &mut Config,
    email: Option<String>,
) -> Result<()> {
    let email = match email.or_else(|| config.last_identifier.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;

    match controller.login(&email, &password).await {
        Ok(session) => {
            config.last_identifier = Some(email);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!(
                "Logged in as {} <{}> ({})",
                session.identity.name, session.identity.email, session.identity.role
            );
            Ok(())
        }
        Err(ApiError::InvalidCredentials) => {
            eprintln!("Invalid email or password");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn whoami(controller: &SessionController) -> Result<()> {
    match controller.current_identity().await {
        Ok(identity) => {
            println!("{} <{}>", identity.name, identity.email);
            println!("  id:   {}", identity.id);
            println!("  role: {}", identity.role);
            if let Some(session) = controller.session() {
                info!(established = %session.established_at, "Session active");
            }
            Ok(())
        }
        Err(e) if e.requires_login() => {
            eprintln!("{}. Run `sessionguard login` first.", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn status(controller: &SessionController, config: &Config) -> Result<()> {
    let credentials = controller.client().credentials();
    let refresh = match credentials.refresh() {
        Ok(Some(_)) => "stored",
        Ok(None) => "none",
        Err(_) => "unavailable",
    };

    println!("Server:             {}", controller.client().base_url());
    println!("Storage backend:    {:?}", config.storage);
    println!("Refresh credential: {}", refresh);
    if let Some(ref last) = config.last_identifier {
        println!("Last login:         {}", last);
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    anyhow::ensure!(!value.is_empty(), "No email given");
    Ok(value)
}
