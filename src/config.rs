use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::engine::{scanner::ScanOptions, scheduler::DaemonSettings};

pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory tree to catalog and serve from.
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub rescan_interval_secs: u64,
    /// Owner recorded for every file the scanner discovers.
    pub default_owner: String,
    pub follow_symlinks: bool,
    pub max_depth: usize,
    /// Use filesystem change notifications between rescans.
    pub watch: bool,
    pub bind: String,
    /// Request header carrying the authenticated user id.
    pub identity_header: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("downloads"),
            db_path: default_db_path(),
            rescan_interval_secs: 60,
            default_owner: "1".to_string(),
            follow_symlinks: false,
            max_depth: ScanOptions::default().max_depth,
            watch: true,
            bind: "127.0.0.1:8830".to_string(),
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            log_dir: None,
        }
    }
}

/// ~/.local/share/stash/catalog.db (or the platform equivalent)
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stash")
        .join("catalog.db")
}

impl Config {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::parse(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rescan_interval_secs == 0 {
            return Err(ConfigError::Invalid("rescan_interval_secs must be at least 1".into()));
        }
        if self.default_owner.trim().is_empty() {
            return Err(ConfigError::Invalid("default_owner must not be empty".into()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if actix_web::http::header::HeaderName::try_from(self.identity_header.as_str()).is_err() {
            return Err(ConfigError::Invalid(format!("identity_header {:?} is not a header name", self.identity_header)));
        }
        Ok(())
    }

    /// The root as an absolute path when it exists, so watcher paths and
    /// scanner paths agree.
    pub fn resolved_root(&self) -> PathBuf {
        self.root.canonicalize().unwrap_or_else(|_| self.root.clone())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions { follow_symlinks: self.follow_symlinks, max_depth: self.max_depth }
    }

    pub fn daemon_settings(&self) -> DaemonSettings {
        DaemonSettings { rescan_interval: Duration::from_secs(self.rescan_interval_secs), watch: self.watch }
    }
}
