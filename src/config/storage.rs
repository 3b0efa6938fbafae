use crate::config::schema::AppConfig;
use crate::error::{PagelensError, Result};
use std::fs;
use std::path::PathBuf;

/// Get the configuration file path based on platform
pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .map(|p| p.join("pagelens"))
        .unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("config.toml")
}

/// Load configuration from file, creating default if not exists
pub fn load_config() -> Result<AppConfig> {
    load_config_from(&get_config_path())
}

/// Load configuration from an explicit path (binary `--config` override)
pub fn load_config_from(config_path: &PathBuf) -> Result<AppConfig> {
    if !config_path.exists() {
        tracing::info!(
            "Config file not found at {:?}, using defaults",
            config_path
        );
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(config_path).map_err(|e| {
        PagelensError::Config(format!(
            "Failed to read config from {:?}: {}",
            config_path, e
        ))
    })?;

    let config: AppConfig = toml::from_str(&content)?;

    tracing::info!("Loaded config from {:?}", config_path);
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig) -> Result<()> {
    let config_path = get_config_path();

    // Ensure parent directory exists
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PagelensError::Config(format!(
                "Failed to create config directory {:?}: {}",
                parent, e
            ))
        })?;
    }

    let content = toml::to_string_pretty(config)?;

    fs::write(&config_path, content).map_err(|e| {
        PagelensError::Config(format!("Failed to write config to {:?}: {}", config_path, e))
    })?;

    tracing::info!("Saved config to {:?}", config_path);
    Ok(())
}
