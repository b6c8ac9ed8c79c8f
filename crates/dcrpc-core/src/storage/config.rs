//! Configuration storage operations

use crate::{models::ClientConfig, Result};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

pub struct ConfigStorage {
    config_dir: PathBuf,
}

impl ConfigStorage {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Loads the config, writing a default one first if none exists yet.
    pub fn load(&self) -> Result<ClientConfig> {
        let config_path = self.path();

        if !config_path.exists() {
            let config = ClientConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;

        // Handle empty file case
        if content.trim().is_empty() {
            let config = ClientConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let config: ClientConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &ClientConfig) -> Result<()> {
        config.validate()?;
        std::fs::create_dir_all(&self.config_dir)?;

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(self.path(), content)?;

        Ok(())
    }
}

/// Reads a config file from an explicit path without creating anything.
pub fn load_from(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FrameFormat;
    use crate::Error;
    use tempfile::TempDir;

    #[test]
    fn test_load_creates_default() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ConfigStorage::new(temp_dir.path().join("nested"));

        let config = storage.load().unwrap();
        assert_eq!(config.version, "1.0.0");
        assert!(storage.path().exists());
    }

    #[test]
    fn test_empty_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ConfigStorage::new(temp_dir.path().to_path_buf());
        std::fs::write(storage.path(), "  \n").unwrap();

        let config = storage.load().unwrap();
        assert_eq!(config.log_level, "info");
        let written = std::fs::read_to_string(storage.path()).unwrap();
        assert!(written.contains("\"log_level\""));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ConfigStorage::new(temp_dir.path().to_path_buf());

        let mut config = ClientConfig::for_executable("/usr/local/bin/engine");
        config.engine.args = vec!["--verbose".to_string()];
        config.rpc.frame_format = FrameFormat::ContentLength;
        storage.save(&config).unwrap();

        let loaded = storage.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.json");
        std::fs::write(&path, r#"{"log_level": "shout"}"#).unwrap();

        assert!(matches!(load_from(&path), Err(Error::Validation(_))));
    }
}
