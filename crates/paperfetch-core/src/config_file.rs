use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api_keys: Option<ApiKeysConfig>,
    pub cache: Option<CacheConfig>,
    pub upstream: Option<UpstreamConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    pub s2_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite durable store location.
    pub path: Option<String>,
    pub search_ttl_secs: Option<u64>,
    pub max_entries: Option<usize>,
    pub max_bytes: Option<usize>,
    /// Default TTL for ephemeral entries.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub min_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub safe_max_limit: Option<usize>,
    pub sort: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("failed to write config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Platform config directory path: `<config_dir>/paperfetch/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("paperfetch").join("config.toml"))
}

/// Load config by cascading CWD `.paperfetch.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".paperfetch.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Field-wise pick: overlay wins, base fills the gaps.
fn pick<S, T>(base: &Option<S>, overlay: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (bk, ok) = (&base.api_keys, &overlay.api_keys);
    let (bc, oc) = (&base.cache, &overlay.cache);
    let (bu, ou) = (&base.upstream, &overlay.upstream);
    ConfigFile {
        api_keys: Some(ApiKeysConfig {
            s2_api_key: pick(bk, ok, |a| a.s2_api_key.clone()),
        }),
        cache: Some(CacheConfig {
            path: pick(bc, oc, |c| c.path.clone()),
            search_ttl_secs: pick(bc, oc, |c| c.search_ttl_secs),
            max_entries: pick(bc, oc, |c| c.max_entries),
            max_bytes: pick(bc, oc, |c| c.max_bytes),
            ttl_secs: pick(bc, oc, |c| c.ttl_secs),
        }),
        upstream: Some(UpstreamConfig {
            base_url: pick(bu, ou, |u| u.base_url.clone()),
            timeout_secs: pick(bu, ou, |u| u.timeout_secs),
            min_interval_ms: pick(bu, ou, |u| u.min_interval_ms),
            max_retries: pick(bu, ou, |u| u.max_retries),
            retry_base_delay_ms: pick(bu, ou, |u| u.retry_base_delay_ms),
            safe_max_limit: pick(bu, ou, |u| u.safe_max_limit),
            sort: pick(bu, ou, |u| u.sort.clone()),
        }),
    }
}

/// Write the config as TOML to `path`, or to [`config_path`] when `None`.
/// Returns the path written.
pub fn save_config(config: &ConfigFile, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_path().ok_or(ConfigError::NoConfigDir)?,
    };
    let io_err = |source| ConfigError::Io {
        path: path.clone(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(io_err)?;
    Ok(path)
}
