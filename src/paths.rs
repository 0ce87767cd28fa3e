//! Path utilities and file system helpers

use std::path::PathBuf;

/// Environment variable that relocates all extension data
pub const DATA_DIR_ENV: &str = "CHATEM_DATA_DIR";

/// Gets the application data directory
pub fn get_app_data_dir() -> Result<PathBuf, String> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::data_dir()
        .map(|p| p.join("com.chatem.extension"))
        .ok_or_else(|| "Could not find app data directory".to_string())
}

/// Clears all application data
pub fn clear_app_data() -> Result<(), String> {
    let app_dir = get_app_data_dir()?;
    if app_dir.exists() {
        std::fs::remove_dir_all(&app_dir)
            .map_err(|e| format!("Failed to clear app data: {}", e))?;
    }
    Ok(())
}

/// Gets the key-value storage database path
pub fn get_storage_path() -> Result<PathBuf, String> {
    get_app_data_dir().map(|p| p.join("storage.db"))
}

/// Gets the host configuration file path
pub fn get_host_config_path() -> Result<PathBuf, String> {
    get_app_data_dir().map(|p| p.join("config.json"))
}
