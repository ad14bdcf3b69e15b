//! bookmill - document pipeline service
//!
//! Runs the job queue and serves the artifact store over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bookmill_common::config::{resolve_root_folder, BookmillConfig};
use bookmill_common::db::BookRegistry;
use bookmill_common::events::EventBus;
use bookmill_pipeline::jobs::JobQueue;
use bookmill_pipeline::pipeline::{pipeline_executors, HttpStepBackend, PipelineContext};
use bookmill_pipeline::{build_router, AppState};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ROOT_FOLDER_ENV: &str = "BOOKMILL_ROOT_FOLDER";

/// Command-line arguments for bookmill
#[derive(Parser, Debug)]
#[command(name = "bookmill")]
#[command(about = "Document pipeline job queue and artifact store")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "BOOKMILL_PORT")]
    port: Option<u16>,

    /// Root folder holding the books
    #[arg(short, long, env = ROOT_FOLDER_ENV)]
    root_folder: Option<PathBuf>,

    /// Config file (default: ~/.config/bookmill/config.toml)
    #[arg(short, long, env = "BOOKMILL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookmill=info,bookmill_pipeline=info,bookmill_common=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting bookmill v{}", env!("CARGO_PKG_VERSION"));

    let config = BookmillConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV, &config);
    let books = Arc::new(BookRegistry::new(&root_folder));
    tokio::fs::create_dir_all(books.books_dir())
        .await
        .with_context(|| format!("Failed to create {}", books.books_dir().display()))?;
    info!("Root folder: {}", root_folder.display());

    if config.step_backend_url.is_none() {
        warn!("step_backend_url is not configured; pipeline jobs will fail");
    }
    let backend = HttpStepBackend::new(
        config.step_backend_url.clone(),
        Duration::from_secs(config.step_timeout_secs),
    )
    .context("Failed to build step backend client")?;

    let executors = pipeline_executors(PipelineContext {
        books: books.clone(),
        backend: Arc::new(backend),
        lock_wait_ms: config.database_lock_wait_ms,
    });
    let queue = JobQueue::new(executors, EventBus::default());

    let state = AppState::new(
        books.clone(),
        queue,
        config.value_domains(),
        config.database_lock_wait_ms,
    );
    let app = build_router(state);

    let port = args.port.unwrap_or(config.port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    books.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
