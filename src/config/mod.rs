use self::grid::GridConfig;
use crate::error::ConfigError;
use anyhow::{Context, Result};
use std::env;
use std::fs;

pub mod creator;
pub mod exchange;
pub mod grid;
pub mod notify;
#[cfg(test)]
mod test_secrets;

pub fn load_config(path: &str) -> Result<GridConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: GridConfig = toml::from_str(&content)?;
    config
        .validate()
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(config)
}

/// Reads `NAME` from the environment, falling back to the file named by `NAME_FILE`.
pub fn read_env_or_file(name: &str) -> Result<String> {
    if let Ok(value) = env::var(name) {
        return Ok(value);
    }
    let file_var = format!("{}_FILE", name);
    let path = env::var(&file_var)
        .with_context(|| format!("Neither {} nor {} is set", name, file_var))?;
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {} at {}", file_var, path))?;
    Ok(content.trim().to_string())
}
