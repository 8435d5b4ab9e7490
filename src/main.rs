use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, net::SocketAddr, path::Path, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, BlobBackend};
use middleware::{admin_auth::StaticTokenCheck, rate_limit::RateLimiter};
use routes::routes::RouteOptions;
use services::{
    blob_store::BlobStore,
    code_generator::RandomCodeGenerator,
    file_service::{DEFAULT_MAX_CODE_ATTEMPTS, FileService, LifecycleSettings},
    memory_blob_store::MemoryBlobStore,
    metadata_store::{MetadataStore, SqliteMetadataStore, run_migrations},
    reconciler::Reconciler,
    scheduler::{parse_schedule, spawn_cleanup_schedule},
    sftp_blob_store::{SftpBlobStore, SftpSettings},
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting shortdrop with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let connect_options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("invalid database URL {}", db_url))?
        .create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .context("connecting to metadata database")?,
    );

    run_migrations(&db).await.context("running migrations")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let blobs: Arc<dyn BlobStore> = match cfg.blob_backend {
        BlobBackend::Sftp => Arc::new(SftpBlobStore::new(SftpSettings {
            host: cfg.sftp_host.clone(),
            port: cfg.sftp_port,
            user: cfg.sftp_user.clone(),
            password: cfg.sftp_password.clone(),
            root: cfg.sftp_root.clone(),
            connect_timeout: cfg.connect_timeout,
            host_key_fingerprint: cfg.sftp_host_key_fingerprint.clone(),
        })),
        BlobBackend::Memory => {
            tracing::warn!("Using in-memory blob store; stored files are lost on restart");
            Arc::new(MemoryBlobStore::new(&cfg.sftp_root))
        }
    };

    if let Err(err) = blobs.check().await {
        tracing::warn!("Blob store not reachable at startup: {}", err);
    }

    let metadata: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::new(db.clone(), cfg.store_timeout));

    let files = FileService::new(
        blobs.clone(),
        metadata.clone(),
        Arc::new(RandomCodeGenerator::new(cfg.code_length)),
        LifecycleSettings {
            retention: cfg.retention(),
            base_url: cfg.base_url.clone(),
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
        },
    );
    let reconciler = Reconciler::new(blobs.clone(), metadata.clone());

    // --- Scheduled cleanup ---
    let schedule = parse_schedule(&cfg.cleanup_schedule)
        .with_context(|| format!("invalid cleanup schedule `{}`", cfg.cleanup_schedule))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = spawn_cleanup_schedule(reconciler.clone(), schedule, shutdown_rx);

    // --- Build router ---
    let state = AppState {
        files,
        reconciler,
        metadata,
        blobs,
    };
    if cfg.admin_token.is_none() {
        tracing::warn!("SHORTDROP_ADMIN_TOKEN is not set; DELETE /cleanup will refuse every request");
    }
    let app: Router = routes::routes::routes(
        state,
        RouteOptions {
            credentials: Arc::new(StaticTokenCheck::new(cfg.admin_token.clone())),
            limiter: RateLimiter::per_minute(cfg.rate_limit_per_minute),
            max_upload_bytes: cfg.max_upload_bytes,
        },
    );

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = scheduler.await {
        tracing::warn!("cleanup scheduler ended abnormally: {}", err);
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
