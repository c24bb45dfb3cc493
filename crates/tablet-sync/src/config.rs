use std::path::PathBuf;
use std::time::Duration;

/// Address of the USB web interface when the tablet is plugged in.
pub const DEFAULT_URL: &str = "http://10.11.99.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the device web interface
    pub base_url: String,
    /// Directory holding `<name>.session` files
    pub workdir: PathBuf,
    /// How long a reachability probe may take
    pub probe_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All optional:
    /// - `TABLET_SYNC_URL`: device base URL (default `http://10.11.99.1`)
    /// - `TABLET_SYNC_DIR`: session directory, supports ~ (default `<data dir>/tablet-sync`)
    /// - `TABLET_SYNC_TIMEOUT_MS`: probe timeout in milliseconds (default 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = match lookup("TABLET_SYNC_URL") {
            Some(url) => validate_url(&url)?,
            None => DEFAULT_URL.to_string(),
        };

        let workdir = match lookup("TABLET_SYNC_DIR") {
            Some(dir) => expand_tilde(&dir),
            None => default_workdir(),
        };

        let probe_timeout = match lookup("TABLET_SYNC_TIMEOUT_MS") {
            Some(raw) => parse_timeout(&raw)?,
            None => Duration::from_millis(DEFAULT_TIMEOUT_MS),
        };

        Ok(Self {
            base_url,
            workdir,
            probe_timeout,
        })
    }
}

pub fn validate_url(url: &str) -> Result<String, ConfigError> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Err(ConfigError::InvalidUrl(url.to_string()))
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::InvalidTimeout(raw.to_string())),
    }
}

fn default_workdir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("tablet-sync"))
        .unwrap_or_else(|| PathBuf::from(".tablet-sync"))
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TABLET_SYNC_URL must be an http(s) URL, got {0:?}")]
    InvalidUrl(String),

    #[error("TABLET_SYNC_TIMEOUT_MS must be a positive number of milliseconds, got {0:?}")]
    InvalidTimeout(String),
}
