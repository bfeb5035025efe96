use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Chunk size used when a writer does not pick one (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Upper bound accepted for any chunk size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Settings of one store handle.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Namespace of the catalogs: `{prefix}_files`, `{prefix}_chunks`.
    pub catalog_prefix: String,

    /// Chunk size applied to writes that leave it unset.
    pub default_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            catalog_prefix: "fs".into(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn new(catalog_prefix: impl Into<String>) -> Self {
        Self {
            catalog_prefix: catalog_prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.default_chunk_size = chunk_size;
        self
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub store: StoreConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked file store over SQLite")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides CHUNK_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Catalog name prefix (overrides CHUNK_STORE_CATALOG_PREFIX)
    #[arg(long)]
    pub catalog_prefix: Option<String>,

    /// Default chunk size in bytes (overrides CHUNK_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Create the catalogs and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge parsed arguments over values found through `lookup`.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = lookup("CHUNK_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "CHUNK_STORE_PORT", 3000u16)?;
        let env_db = lookup("CHUNK_STORE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/chunk_store.db".into());
        let env_prefix = lookup("CHUNK_STORE_CATALOG_PREFIX").unwrap_or_else(|| "fs".into());
        let env_chunk = parse_var(&lookup, "CHUNK_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            store: StoreConfig {
                catalog_prefix: args.catalog_prefix.unwrap_or(env_prefix),
                default_chunk_size: args.chunk_size.unwrap_or(env_chunk),
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
