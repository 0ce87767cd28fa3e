//! Host configuration: where the API lives and where data is kept

use crate::paths::{get_host_config_path, get_storage_path};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the API base URL at runtime
pub const API_URL_ENV: &str = "CHATEM_API_URL";

fn default_api_base_url() -> String {
    env!("CHATEM_DEFAULT_API_URL").to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Defaults to `storage.db` in the app data directory
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            storage_path: None,
        }
    }
}

impl HostConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn resolve_storage_path(&self) -> Result<PathBuf, String> {
        match &self.storage_path {
            Some(path) => Ok(path.clone()),
            None => get_storage_path(),
        }
    }

    /// Applies environment overrides on top of the file values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        self
    }
}

/// Loads the host config, falling back to defaults when no file exists
pub fn load_host_config() -> Result<HostConfig, String> {
    let config_path = get_host_config_path()?;
    load_host_config_from(&config_path)
}

pub fn load_host_config_from(config_path: &Path) -> Result<HostConfig, String> {
    let config = if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read host config: {}", e))?;
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse host config: {}", e))?
    } else {
        info!(
            "[load_host_config] No config at {:?}, using defaults",
            config_path
        );
        HostConfig::default()
    };
    Ok(config.with_env_overrides())
}

pub fn save_host_config(config: &HostConfig) -> Result<(), String> {
    let config_path = get_host_config_path()?;
    save_host_config_to(&config_path, config)
}

pub fn save_host_config_to(config_path: &Path, config: &HostConfig) -> Result<(), String> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory: {}", e))?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize host config: {}", e))?;
    std::fs::write(config_path, content).map_err(|e| format!("Failed to save host config: {}", e))
}
