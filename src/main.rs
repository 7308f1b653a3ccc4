use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use phash_gate::api::{self, AppState};
use phash_gate::config::AppCfg;
use phash_gate::ingest::IngestPipeline;
use phash_gate::postgres::{self, PgImageRepository};
use phash_gate::repository::{ImageRepository, MemoryImageRepository};
use phash_gate::store::{CloudinaryStore, MemoryObjectStore, ObjectStore};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to load .env");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("phash_gate=info,tower_http=info")),
        )
        .init();

    let cfg = AppCfg::from_env().context("invalid configuration")?;

    let pool = if cfg.db.is_configured() {
        Some(postgres::connect(&cfg.db).await?)
    } else {
        None
    };
    let repo: Arc<dyn ImageRepository> = match &pool {
        Some(pool) => Arc::new(PgImageRepository::new(pool.clone())),
        None => {
            tracing::warn!("no database configured; records live in memory and vanish on restart");
            Arc::new(MemoryImageRepository::new())
        }
    };

    let store: Arc<dyn ObjectStore> = match &cfg.store.cloud_name {
        Some(cloud) => Arc::new(
            CloudinaryStore::new(&cfg.store, cloud.clone()).context("failed to build object store client")?,
        ),
        None => {
            tracing::warn!("CLOUDINARY_CLOUD_NAME not set; uploads kept in memory");
            Arc::new(MemoryObjectStore::new())
        }
    };

    tracing::info!(
        repo = repo.name(),
        store = store.name(),
        strategy = ?cfg.dedupe.strategy,
        canonical_width = cfg.dedupe.canonical_width,
        "starting"
    );

    let pipeline = IngestPipeline::new(
        repo,
        store,
        &cfg.dedupe,
        cfg.store.folder.clone(),
        cfg.store.upload_timeout,
    );
    let app = api::router(AppState::new(Arc::new(pipeline)), cfg.server.max_upload_bytes);

    let result = api::serve(cfg.server.bind_addr(), app, shutdown_signal()).await;

    if let Some(pool) = pool {
        pool.close().await;
        tracing::info!("database pool closed");
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
    tracing::info!("shutdown signal received");
}
