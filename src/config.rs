use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

use crate::services::{
    blob_store::normalize_root, code_generator::DEFAULT_CODE_LENGTH,
    scheduler::DEFAULT_CLEANUP_SCHEDULE,
};

/// Which blob store implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BlobBackend {
    Sftp,
    Memory,
}

impl FromStr for BlobBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sftp" => Ok(Self::Sftp),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown blob backend `{}` (expected sftp or memory)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub blob_backend: BlobBackend,
    pub sftp_host: String,
    pub sftp_port: u16,
    pub sftp_user: String,
    pub sftp_password: String,
    pub sftp_root: String,
    pub sftp_host_key_fingerprint: Option<String>,
    pub base_url: String,
    pub retention_days: u32,
    pub code_length: usize,
    pub admin_token: Option<String>,
    pub cleanup_schedule: String,
    pub rate_limit_per_minute: u32,
    pub connect_timeout: Duration,
    pub store_timeout: Duration,
    pub max_upload_bytes: usize,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("blob_backend", &self.blob_backend)
            .field("sftp_host", &self.sftp_host)
            .field("sftp_port", &self.sftp_port)
            .field("sftp_user", &self.sftp_user)
            .field("sftp_root", &self.sftp_root)
            .field("base_url", &self.base_url)
            .field("retention_days", &self.retention_days)
            .field("code_length", &self.code_length)
            .field("admin_token_set", &self.admin_token.is_some())
            .field("cleanup_schedule", &self.cleanup_schedule)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("connect_timeout", &self.connect_timeout)
            .field("store_timeout", &self.store_timeout)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file sharing with short download codes")]
pub struct Args {
    /// Host to bind to (overrides SHORTDROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHORTDROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Metadata database URL (overrides SHORTDROP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Blob store backend (overrides SHORTDROP_BLOB_BACKEND)
    #[arg(long, value_enum)]
    pub blob_backend: Option<BlobBackend>,

    /// SFTP server host (overrides SHORTDROP_SFTP_HOST)
    #[arg(long)]
    pub sftp_host: Option<String>,

    /// SFTP server port (overrides SHORTDROP_SFTP_PORT)
    #[arg(long)]
    pub sftp_port: Option<u16>,

    /// SFTP root directory for stored files (overrides SHORTDROP_SFTP_ROOT)
    #[arg(long)]
    pub sftp_root: Option<String>,

    /// Public base URL used in download links (overrides SHORTDROP_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Days a file stays downloadable (overrides SHORTDROP_RETENTION_DAYS)
    #[arg(long)]
    pub retention_days: Option<u32>,

    /// Cron expression for scheduled cleanup (overrides SHORTDROP_CLEANUP_SCHEDULE)
    #[arg(long)]
    pub cleanup_schedule: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI values over environment values over defaults.
    fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| -> Result<Option<u64>> {
            var(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .with_context(|| format!("parsing {} value `{}`", key, value))
                })
                .transpose()
        };

        let env_port = parsed("SHORTDROP_PORT")?
            .map(u16::try_from)
            .transpose()
            .context("SHORTDROP_PORT out of range")?;
        let env_sftp_port = parsed("SHORTDROP_SFTP_PORT")?
            .map(u16::try_from)
            .transpose()
            .context("SHORTDROP_SFTP_PORT out of range")?;
        let env_retention = parsed("SHORTDROP_RETENTION_DAYS")?
            .map(u32::try_from)
            .transpose()
            .context("SHORTDROP_RETENTION_DAYS out of range")?;
        let env_backend = var("SHORTDROP_BLOB_BACKEND")
            .map(|v| v.parse::<BlobBackend>())
            .transpose()?;

        let retention_days = args.retention_days.or(env_retention).unwrap_or(7);
        if retention_days == 0 {
            bail!("retention must be at least one day");
        }

        let code_length = parsed("SHORTDROP_CODE_LENGTH")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_CODE_LENGTH);
        if !(4..=32).contains(&code_length) {
            bail!("SHORTDROP_CODE_LENGTH must be between 4 and 32, got {}", code_length);
        }

        let secs = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(parsed(key)?.unwrap_or(default)))
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| var("SHORTDROP_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.or(env_port).unwrap_or(8080),
            database_url: args
                .database_url
                .or_else(|| var("SHORTDROP_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/shortdrop.db".into()),
            blob_backend: args.blob_backend.or(env_backend).unwrap_or(BlobBackend::Sftp),
            sftp_host: args
                .sftp_host
                .or_else(|| var("SHORTDROP_SFTP_HOST"))
                .unwrap_or_else(|| "localhost".into()),
            sftp_port: args.sftp_port.or(env_sftp_port).unwrap_or(22),
            sftp_user: var("SHORTDROP_SFTP_USER").unwrap_or_else(|| "shortdrop".into()),
            sftp_password: var("SHORTDROP_SFTP_PASSWORD").unwrap_or_default(),
            sftp_root: normalize_root(
                &args
                    .sftp_root
                    .or_else(|| var("SHORTDROP_SFTP_ROOT"))
                    .unwrap_or_else(|| "/shortdrop".into()),
            ),
            sftp_host_key_fingerprint: var("SHORTDROP_SFTP_HOST_KEY_FINGERPRINT"),
            base_url: args
                .base_url
                .or_else(|| var("SHORTDROP_BASE_URL"))
                .unwrap_or_else(|| "http://localhost:8080".into()),
            retention_days,
            code_length,
            admin_token: var("SHORTDROP_ADMIN_TOKEN"),
            cleanup_schedule: args
                .cleanup_schedule
                .or_else(|| var("SHORTDROP_CLEANUP_SCHEDULE"))
                .unwrap_or_else(|| DEFAULT_CLEANUP_SCHEDULE.into()),
            rate_limit_per_minute: parsed("SHORTDROP_RATE_LIMIT_PER_MINUTE")?
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(100),
            connect_timeout: secs("SHORTDROP_CONNECT_TIMEOUT_SECS", 30)?,
            store_timeout: secs("SHORTDROP_STORE_TIMEOUT_SECS", 5)?,
            max_upload_bytes: parsed("SHORTDROP_MAX_UPLOAD_MB")?.unwrap_or(100) as usize
                * 1024
                * 1024,
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}
