use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::ClientError;
use crate::sync::DEFAULT_RECONNECT_INTERVAL_MS;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8081";
pub const DEFAULT_LOG_FILE: &str = "autosync.log";

const CONFIG_DIR_NAME: &str = "autosync";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub reconnect_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: DEFAULT_SERVER.to_string(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            download_dir: None,
            log_file: None,
        }
    }
}

impl ClientConfig {
    /// Where downloads land: configured directory, else the user's download folder,
    /// else the working directory.
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn log_file(&self) -> &str {
        self.log_file.as_deref().unwrap_or(DEFAULT_LOG_FILE)
    }

    /// Apply command line overrides on top of the stored values.
    pub fn with_overrides(mut self, server: Option<&str>, log_file: Option<&str>) -> Self {
        if let Some(server) = server {
            self.server = server.to_string();
        }
        if let Some(log_file) = log_file {
            self.log_file = Some(log_file.to_string());
        }
        self
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&contents)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        if config.reconnect_interval_ms == 0 {
            return Err(ClientError::Config(format!(
                "{}: reconnect_interval_ms must be greater than zero",
                path.display()
            )));
        }
        info!("Loaded config for {} from {}", config.server, path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| ClientError::Config(format!("cannot write {}: {}", path.display(), e)))?;

        info!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn load() -> Result<Self, ClientError> {
        Self::load_from(&config_path()?)
    }

    pub fn save(&self) -> Result<(), ClientError> {
        self.save_to(&config_path()?)
    }
}

pub fn config_dir() -> Result<PathBuf, ClientError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME))
        .ok_or_else(|| ClientError::Config("could not determine config directory".to_string()))
}

pub fn config_path() -> Result<PathBuf, ClientError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}
