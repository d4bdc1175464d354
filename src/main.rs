use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use schedportal::auth::TokenIssuer;
use schedportal::config::Config;
use schedportal::lifecycle::spawn_code_sweeper;
use schedportal::notifications::SmtpMailer;
use schedportal::persistence::{AtomicWriter, SaveQueue};
use schedportal::store::DocumentStore;
use schedportal::AppState;

#[derive(Parser, Debug)]
#[command(name = "schedportal")]
#[command(author, version, about = "Scheduling portal administrative backend", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "schedportal.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting schedportal v{}", env!("CARGO_PKG_VERSION"));

    // Load the document, recovering from a crashed write if needed
    let writer = Arc::new(AtomicWriter::new(
        config.store_path(),
        config.storage.backup_grace(),
    ));
    let snapshot = writer
        .open()
        .await
        .with_context(|| format!("Failed to open store at {}", writer.path().display()))?;
    let store = Arc::new(DocumentStore::new(snapshot));
    let (saver, save_worker) =
        SaveQueue::spawn(store.clone(), writer.clone(), config.storage.queue_capacity);

    let jwt_secret = match config.auth.jwt_secret.clone() {
        Some(secret) if !secret.trim().is_empty() => secret,
        _ => {
            tracing::warn!("No auth.jwt_secret configured, sessions will not survive a restart");
            uuid::Uuid::new_v4().simple().to_string()
        }
    };
    let tokens = TokenIssuer::new(&jwt_secret, config.auth.token_ttl_hours);

    let mailer = SmtpMailer::new(config.email.clone());
    if !mailer.is_enabled() {
        tracing::warn!("SMTP not configured, verification emails will not be delivered");
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        saver.clone(),
        Arc::new(mailer),
        tokens,
    ));

    // Ensure the superadmin account exists
    if state
        .accounts
        .ensure_superadmin()
        .await
        .context("Failed to seed superadmin account")?
    {
        tracing::info!("Superadmin account created");
    }

    let sweeper = spawn_code_sweeper(
        state.codes.clone(),
        Duration::from_secs(config.storage.sweep_interval_secs.max(1)),
    );

    let app = schedportal::api::create_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();

    // Flush whatever the last requests left in memory
    match saver.enqueue_save().await {
        Ok(()) => tracing::info!(writes = writer.writes_completed(), "Final save complete"),
        Err(e) => tracing::error!(error = %e, "Final save failed"),
    }
    drop(state);
    drop(saver);
    let _ = tokio::time::timeout(Duration::from_secs(5), save_worker).await;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
