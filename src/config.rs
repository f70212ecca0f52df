use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::upload_pipeline::{DEFAULT_RESULT_CHANNEL_CAPACITY, PipelineSettings};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub bucket: String,
    pub database_url: String,
    pub jwt_secret: Option<String>,
    pub upload_timeout_secs: u64,
    pub max_upload_mb: usize,
    pub result_channel_capacity: usize,
}

/// What the process should do once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    SweepOrphans,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Audio upload and metadata service")]
pub struct Args {
    /// Host to bind to (overrides AUDIO_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides AUDIO_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding object buckets (overrides AUDIO_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket for audio bytes (overrides AUDIO_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Database URL (overrides AUDIO_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// HS256 secret for access tokens (overrides AUDIO_STORE_JWT_SECRET)
    #[arg(long)]
    pub jwt_secret: Option<String>,

    /// Max seconds to wait for all parts of one upload (overrides AUDIO_STORE_UPLOAD_TIMEOUT_SECS)
    #[arg(long)]
    pub upload_timeout_secs: Option<u64>,

    /// Request body limit in MiB (overrides AUDIO_STORE_MAX_UPLOAD_MB)
    #[arg(long)]
    pub max_upload_mb: Option<usize>,

    /// Result channel slots per upload (overrides AUDIO_STORE_RESULT_CHANNEL_CAPACITY)
    #[arg(long)]
    pub result_channel_capacity: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Delete stored objects that have no metadata row, then exit
    #[arg(long, conflicts_with = "migrate")]
    pub sweep_orphans: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("AUDIO_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("AUDIO_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("AUDIO_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_bucket = env::var("AUDIO_STORE_BUCKET").unwrap_or_else(|_| "audiofiles".into());
        let env_db = env::var("AUDIO_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/audio_store.db".into());
        let env_secret = env::var("AUDIO_STORE_JWT_SECRET").ok();
        let env_timeout = env_parse("AUDIO_STORE_UPLOAD_TIMEOUT_SECS", 300u64)?;
        let env_max_upload = env_parse("AUDIO_STORE_MAX_UPLOAD_MB", 512usize)?;
        let env_capacity = env_parse(
            "AUDIO_STORE_RESULT_CHANNEL_CAPACITY",
            DEFAULT_RESULT_CHANNEL_CAPACITY,
        )?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            bucket: args.bucket.unwrap_or(env_bucket),
            database_url: args.database_url.unwrap_or(env_db),
            jwt_secret: args.jwt_secret.or(env_secret),
            upload_timeout_secs: args.upload_timeout_secs.unwrap_or(env_timeout),
            max_upload_mb: args.max_upload_mb.unwrap_or(env_max_upload),
            result_channel_capacity: args.result_channel_capacity.unwrap_or(env_capacity),
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.sweep_orphans {
            RunMode::SweepOrphans
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            result_channel_capacity: self.result_channel_capacity,
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            ..PipelineSettings::default()
        }
    }
}

/// Read and parse `name`, falling back to `default` when it is unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
