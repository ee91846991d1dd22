//! Client configuration, read from a TOML file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs::check_control_dir;
use crate::sync::queue::DEFAULT_MAX_PARALLEL_DOWNLOADS;

/// Name of the hidden control directory created inside the project.
pub const DEFAULT_CONTROL_DIR: &str = ".fieldsync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API root of the remote project store.
    pub base_url: String,
    /// Authentication token, sent as `Authorization: Token <token>`.
    pub token: Option<String>,
    /// Upper bound of concurrent download requests.
    pub max_parallel_downloads: usize,
    /// Control directory holding the staging area, relative to the project root.
    pub control_dir: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "https://app.qfield.cloud/api/v1/".to_string(),
            token: None,
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            control_dir: DEFAULT_CONTROL_DIR.to_string(),
            user_agent: format!("fieldsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Default location: `<config dir>/fieldsync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fieldsync").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if config.max_parallel_downloads == 0 {
            anyhow::bail!("max_parallel_downloads must be at least 1 in {}", path.display());
        }
        check_control_dir(&config.control_dir).with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }
}
