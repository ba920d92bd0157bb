use crate::services::storage::remote::S3Options;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, str::FromStr};

const ENV_PREFIX: &str = "BLOB_STORE_";

/// Where blob content is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageMode {
    Local,
    S3,
}

/// Which metadata store backs records and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetaBackend {
    Sqlite,
    Index,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Path the router is nested under, e.g. `/api`. Empty for the root.
    pub http_prefix: String,
    pub storage_mode: StorageMode,
    pub storage_dir: String,
    pub meta_backend: MetaBackend,
    pub database_url: String,
    pub index_dir: String,
    pub max_upload_size: u64,
    pub s3: S3Options,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Blob storage service with searchable metadata")]
pub struct Args {
    /// Host to bind to (overrides BLOB_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOB_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Path prefix for every route (overrides BLOB_STORE_HTTP_PREFIX)
    #[arg(long)]
    pub http_prefix: Option<String>,

    /// Storage backend (overrides BLOB_STORE_STORAGE_MODE)
    #[arg(long, value_enum)]
    pub storage_mode: Option<StorageMode>,

    /// Directory where blobs are stored in local mode (overrides BLOB_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata store (overrides BLOB_STORE_META_BACKEND)
    #[arg(long, value_enum)]
    pub meta_backend: Option<MetaBackend>,

    /// Database URL (overrides BLOB_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Search index directory (overrides BLOB_STORE_INDEX_DIR)
    #[arg(long)]
    pub index_dir: Option<String>,

    /// Upload size limit in bytes (overrides BLOB_STORE_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Bucket for s3 mode (overrides BLOB_STORE_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Key prefix inside the bucket (overrides BLOB_STORE_S3_PREFIX)
    #[arg(long)]
    pub s3_prefix: Option<String>,

    /// Bucket region (overrides BLOB_STORE_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint (overrides BLOB_STORE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Allow plain-HTTP S3 endpoints (overrides BLOB_STORE_S3_ALLOW_HTTP)
    #[arg(long)]
    pub s3_allow_http: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over `env` over defaults. `env` is queried with full
    /// variable names such as `BLOB_STORE_PORT`; blank values count as unset.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |name: &str| {
            env(&format!("{}{}", ENV_PREFIX, name)).filter(|value| !value.trim().is_empty())
        };

        let port = match args.port {
            Some(port) => port,
            None => parse_env(&lookup, "PORT")?.unwrap_or(3000),
        };
        let max_upload_size = match args.max_upload_size {
            Some(limit) => limit,
            None => parse_env(&lookup, "MAX_UPLOAD_SIZE")?.unwrap_or(100 * 1024 * 1024),
        };
        let storage_mode = match args.storage_mode {
            Some(mode) => mode,
            None => enum_env(&lookup, "STORAGE_MODE")?.unwrap_or(StorageMode::Local),
        };
        let meta_backend = match args.meta_backend {
            Some(backend) => backend,
            None => enum_env(&lookup, "META_BACKEND")?.unwrap_or(MetaBackend::Sqlite),
        };
        let allow_http = args.s3_allow_http
            || parse_env::<bool>(&lookup, "S3_ALLOW_HTTP")?.unwrap_or(false);

        let cfg = Self {
            host: args.host.or_else(|| lookup("HOST")).unwrap_or_else(|| "0.0.0.0".into()),
            port,
            http_prefix: normalize_prefix(
                &args.http_prefix.or_else(|| lookup("HTTP_PREFIX")).unwrap_or_default(),
            ),
            storage_mode,
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/blobs".into()),
            meta_backend,
            database_url: args
                .database_url
                .or_else(|| lookup("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/blob_store.db".into()),
            index_dir: args
                .index_dir
                .or_else(|| lookup("INDEX_DIR"))
                .unwrap_or_else(|| "./data/meta/index".into()),
            max_upload_size,
            s3: S3Options {
                bucket: args.s3_bucket.or_else(|| lookup("S3_BUCKET")).unwrap_or_default(),
                prefix: args.s3_prefix.or_else(|| lookup("S3_PREFIX")).unwrap_or_default(),
                region: args.s3_region.or_else(|| lookup("S3_REGION")),
                endpoint: args.s3_endpoint.or_else(|| lookup("S3_ENDPOINT")),
                allow_http,
            },
        };

        if cfg.storage_mode == StorageMode::S3 && cfg.s3.bucket.trim().is_empty() {
            bail!("storage mode `s3` requires {}S3_BUCKET or --s3-bucket", ENV_PREFIX);
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|err| {
                anyhow::anyhow!("parsing {}{} value `{}`: {}", ENV_PREFIX, name, value, err)
            })
        })
        .transpose()
}

fn enum_env<T: ValueEnum>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    lookup(name)
        .map(|value| {
            T::from_str(value.trim(), true)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing {}{}", ENV_PREFIX, name))
        })
        .transpose()
}

/// `api/` -> `/api`, `/` -> ``
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
