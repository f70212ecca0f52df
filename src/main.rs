use anyhow::{Context, Result};
use audio_store::{
    AppState, build_router,
    auth::JwtAuth,
    config::{AppConfig, RunMode},
    services::{
        metadata::LoftyExtractor,
        object_store::FsObjectStore,
        reconcile::{DEFAULT_SWEEP_GRACE, sweep_orphans},
        record_store::SqliteRecordStore,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        storage_dir = %cfg.storage_dir,
        bucket = %cfg.bucket,
        database_url = %cfg.database_url,
        ?mode,
        "Starting audio-store"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let connect_options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database URL `{}`", cfg.database_url))?
        .create_if_missing(true);
    if let Some(parent) = connect_options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?,
    );
    let records = Arc::new(SqliteRecordStore::new(db));
    let objects = Arc::new(FsObjectStore::new(&cfg.storage_dir, &cfg.bucket));

    match mode {
        RunMode::Migrate => {
            records.migrate().await?;
            tracing::info!("Database migration complete.");
            return Ok(()); // exit after migration
        }
        RunMode::SweepOrphans => {
            let report = sweep_orphans(objects.as_ref(), records.as_ref(), DEFAULT_SWEEP_GRACE).await?;
            tracing::info!(
                scanned = report.scanned,
                deleted = report.deleted,
                failed = report.failed,
                stale_uploads = report.stale_uploads,
                "Orphan sweep complete."
            );
            return Ok(());
        }
        RunMode::Serve => {}
    }

    let secret = cfg
        .jwt_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .context("AUDIO_STORE_JWT_SECRET (or --jwt-secret) is required to serve")?;

    // --- Initialize core services ---
    let state = AppState::new(
        objects,
        records,
        Arc::new(LoftyExtractor),
        JwtAuth::new(secret.as_bytes()),
        cfg.pipeline_settings(),
    );

    // --- Build router ---
    let app = build_router(state, cfg.max_upload_bytes());

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
    axum::serve(listener, app).await?;

    Ok(())
}
