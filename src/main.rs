use anyhow::{Context, Result};
use axum::Router;
use blob_store::{
    config::{AppConfig, MetaBackend, StorageMode},
    routes,
    services::{
        blob_service::BlobService,
        ids::UuidV7Ids,
        metadata::{MetadataStore, index::IndexMetadataStore, sqlite::SqliteMetadataStore},
        storage::{StorageBackend, local::LocalBackend, remote::RemoteBackend},
    },
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting blob-store with config: {:?}", cfg);

    // --- Handle migration mode ---
    if migrate {
        let store = SqliteMetadataStore::connect(&cfg.database_url)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?;
        store.migrate().await.context("running migrations")?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize backends ---
    let meta: Arc<dyn MetadataStore> = match cfg.meta_backend {
        MetaBackend::Sqlite => {
            let store = SqliteMetadataStore::connect(&cfg.database_url)
                .await
                .with_context(|| format!("connecting to {}", cfg.database_url))?;
            store.migrate().await.context("running migrations")?;
            Arc::new(store)
        }
        MetaBackend::Index => Arc::new(
            IndexMetadataStore::open(&cfg.index_dir)
                .await
                .with_context(|| format!("opening search index at {}", cfg.index_dir))?,
        ),
    };

    let storage: Arc<dyn StorageBackend> = match cfg.storage_mode {
        StorageMode::Local => Arc::new(
            LocalBackend::open(&cfg.storage_dir)
                .await
                .with_context(|| format!("opening storage directory {}", cfg.storage_dir))?,
        ),
        StorageMode::S3 => Arc::new(RemoteBackend::s3(&cfg.s3).context("configuring S3 backend")?),
    };

    tracing::info!(
        "Using {} metadata store and {} storage backend",
        meta.kind(),
        storage.kind()
    );

    let service = BlobService::new(meta, storage, Arc::new(UuidV7Ids), cfg.max_upload_size);

    // --- Build router ---
    let app: Router = routes::routes::routes(&cfg.http_prefix).with_state(service);

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

    tracing::info!("Server listening on http://{}{}", listener.local_addr()?, cfg.http_prefix);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
