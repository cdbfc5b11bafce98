use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::{
    commit::RetryPolicy, upload_service::ServiceSettings, validator::UploadLimits,
};

const ENV_PREFIX: &str = "UPLOAD_GATEWAY_";

/// Upper bound for session and link lifetimes (30 days).
const MAX_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_base_url: String,
    pub signing_secret: String,
    pub allowed_content_types: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub max_part_size: u64,
    pub max_upload_size: u64,
    pub session_ttl_secs: u64,
    pub grant_ttl_secs: u64,
    pub max_grant_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub backend_timeout_secs: u64,
    pub commit_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable multipart upload gateway")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides UPLOAD_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL retrieval links point at (overrides UPLOAD_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Largest accepted part in bytes (overrides UPLOAD_GATEWAY_MAX_PART_SIZE)
    #[arg(long)]
    pub max_part_size: Option<u64>,

    /// Largest accepted upload in bytes (overrides UPLOAD_GATEWAY_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Session lifetime in seconds, counted from creation (overrides UPLOAD_GATEWAY_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_sources(args, |name| env::var(name).ok())
    }

    /// Merge `args` over variables read through `lookup`, over defaults.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<(Self, bool)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        let signing_secret = var("SIGNING_SECRET").unwrap_or_default();
        if signing_secret.trim().is_empty() {
            bail!("{}SIGNING_SECRET must be set", ENV_PREFIX);
        }

        let cfg = Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: pick(args.port, &var, "PORT", 3000)?,
            storage_dir: args
                .storage_dir
                .or_else(|| var("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/upload_gateway.db".into()),
            public_base_url: args
                .public_base_url
                .or_else(|| var("PUBLIC_BASE_URL"))
                .unwrap_or_else(|| "http://127.0.0.1:3000".into()),
            signing_secret,
            allowed_content_types: var("ALLOWED_CONTENT_TYPES")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| {
                    split_list("image/png,image/jpeg,text/plain,application/pdf")
                }),
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            max_part_size: pick(args.max_part_size, &var, "MAX_PART_SIZE", 8 * 1024 * 1024)?,
            max_upload_size: pick(
                args.max_upload_size,
                &var,
                "MAX_UPLOAD_SIZE",
                5 * 1024 * 1024 * 1024,
            )?,
            session_ttl_secs: pick(args.session_ttl_secs, &var, "SESSION_TTL_SECS", 86_400)?,
            grant_ttl_secs: pick(None, &var, "GRANT_TTL_SECS", 3_600)?,
            max_grant_ttl_secs: pick(None, &var, "MAX_GRANT_TTL_SECS", 604_800)?,
            sweep_interval_secs: pick(None, &var, "SWEEP_INTERVAL_SECS", 60)?,
            backend_timeout_secs: pick(None, &var, "BACKEND_TIMEOUT_SECS", 30)?,
            commit_max_attempts: pick(None, &var, "COMMIT_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: pick(None, &var, "RETRY_BASE_DELAY_MS", 100)?,
        };

        if cfg.max_part_size == 0 || cfg.max_part_size > cfg.max_upload_size {
            bail!(
                "max_part_size ({}) must be in 1..=max_upload_size ({})",
                cfg.max_part_size,
                cfg.max_upload_size
            );
        }
        for (name, secs) in [
            ("session_ttl_secs", cfg.session_ttl_secs),
            ("max_grant_ttl_secs", cfg.max_grant_ttl_secs),
        ] {
            if secs == 0 || secs > MAX_TTL_SECS {
                bail!("{} ({}) must be in 1..={}", name, secs, MAX_TTL_SECS);
            }
        }
        if cfg.grant_ttl_secs == 0 || cfg.grant_ttl_secs > cfg.max_grant_ttl_secs {
            bail!(
                "grant_ttl_secs ({}) must be in 1..=max_grant_ttl_secs ({})",
                cfg.grant_ttl_secs,
                cfg.max_grant_ttl_secs
            );
        }
        if cfg.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            limits: UploadLimits {
                max_part_size: self.max_part_size,
                max_upload_size: self.max_upload_size,
                allowed_content_types: self.allowed_content_types.clone(),
            },
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            grant_ttl: Duration::from_secs(self.grant_ttl_secs),
            max_grant_ttl: Duration::from_secs(self.max_grant_ttl_secs),
            retry: RetryPolicy {
                max_attempts: self.commit_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                timeout: Duration::from_secs(self.backend_timeout_secs),
            },
        }
    }
}

/// CLI value, else the parsed environment variable, else `default`.
fn pick<T, V>(cli: Option<T>, var: &V, suffix: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match var(suffix) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, suffix, raw)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
