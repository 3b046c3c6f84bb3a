use std::path::{Path, PathBuf};

use tidemark_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

pub const ENV_DATABASE: &str = "TIDEMARK_DATABASE";
pub const ENV_LOCK_TIMEOUT_MS: &str = "TIDEMARK_LOCK_TIMEOUT_MS";

/// Reads `AppConfig` from disk and layers environment overrides on top.
pub struct ConfigLoader;

impl ConfigLoader {
    /// `~/.tidemark`
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tidemark")
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yml")
    }

    /// Load from `path` (or the default location). A missing file at the
    /// default location yields defaults; a missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Self::default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    debug!("no config at {}, using defaults", default.display());
                    AppConfig::default()
                }
            }
        };

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::parse(path, &contents)?;
        info!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Pick a parser by file extension.
    pub fn parse(path: &Path, contents: &str) -> Result<AppConfig> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => toml::from_str(contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}"))),
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }

    pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            debug!("{ENV_DATABASE} overrides database.path");
            config.database.path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT_MS).filter(|v| !v.is_empty()) {
            config.lock.timeout_ms = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{ENV_LOCK_TIMEOUT_MS} must be an integer, got '{raw}'"))
            })?;
        }
        Ok(())
    }
}
