#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use clap::Args;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 8;
pub const DEFAULT_LISTING_LIMIT: usize = 30;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 3600;

/// Everything the binaries need to wire up an orchestrator.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub download_root: PathBuf,
    pub media_library: Option<PathBuf>,
    pub ytdlp: PathBuf,
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub listing_limit: usize,
    pub probe_timeout: Duration,
    pub download_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_dir: Option<PathBuf>,
    pub download_root: Option<PathBuf>,
    pub media_library: Option<PathBuf>,
    pub ytdlp: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub env_path: Option<PathBuf>,
}

/// Command-line flags shared by every binary. Each one beats the matching
/// `TUBEVAULT_*` variable.
#[derive(Args, Debug, Clone, Default)]
pub struct RuntimeArgs {
    /// Directory holding subscriptions, settings, schedule and the run log
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Root of the per-channel download tree
    #[arg(long, global = true)]
    pub download_root: Option<PathBuf>,

    /// Directory finished files are hardlinked into when auto-hardlink is on
    #[arg(long, global = true)]
    pub media_library: Option<PathBuf>,

    /// yt-dlp executable
    #[arg(long, global = true)]
    pub ytdlp: Option<PathBuf>,

    /// Subscriptions fetched in parallel during a run
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// .env file to read defaults from
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,
}

impl From<RuntimeArgs> for RuntimeOverrides {
    fn from(args: RuntimeArgs) -> Self {
        Self {
            data_dir: args.data_dir,
            download_root: args.download_root,
            media_library: args.media_library,
            ytdlp: args.ytdlp,
            workers: args.workers,
            env_path: args.env_file,
            ..Self::default()
        }
    }
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_dir = overrides
        .data_dir
        .or_else(|| lookup("TUBEVAULT_DATA_DIR").map(PathBuf::from))
        .ok_or_else(|| anyhow!("TUBEVAULT_DATA_DIR not set"))?;
    let download_root = overrides
        .download_root
        .or_else(|| lookup("TUBEVAULT_DOWNLOAD_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("TUBEVAULT_DOWNLOAD_ROOT not set"))?;
    let media_library = overrides
        .media_library
        .or_else(|| lookup("TUBEVAULT_MEDIA_LIBRARY").map(PathBuf::from));
    let ytdlp = overrides
        .ytdlp
        .or_else(|| lookup("TUBEVAULT_YTDLP").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBEVAULT_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("TUBEVAULT_PORT").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_PORT);
    let workers = overrides
        .workers
        .or_else(|| lookup("TUBEVAULT_WORKERS").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_WORKERS)
        .clamp(1, MAX_WORKERS);
    let listing_limit = lookup("TUBEVAULT_LISTING_LIMIT")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_LISTING_LIMIT);
    let probe_timeout = lookup("TUBEVAULT_PROBE_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);
    let download_timeout = lookup("TUBEVAULT_DOWNLOAD_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);

    Ok(RuntimeConfig {
        data_dir,
        download_root,
        media_library,
        ytdlp,
        host,
        port,
        workers,
        listing_limit,
        probe_timeout: Duration::from_secs(probe_timeout),
        download_timeout: Duration::from_secs(download_timeout),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
