//! Client configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the engine executable.
pub const SERVER_PATH_ENV: &str = "DELTA_CHAT_RPC_SERVER";

/// Engine executable used when neither the config nor the environment names one.
pub const DEFAULT_SERVER: &str = "deltachat-rpc-server";

/// Environment variable through which the engine learns its accounts directory.
pub const ACCOUNTS_PATH_ENV: &str = "DC_ACCOUNTS_PATH";

const MAX_FRAME_SIZE_LIMIT: usize = 1024 * 1024 * 1024;
const MAX_STARTUP_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const MAX_SHUTDOWN_GRACE_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// One JSON object per line.
    #[default]
    Lines,
    /// `Content-Length: N` header block followed by the body.
    ContentLength,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub version: String,
    pub engine: EngineConfig,
    pub rpc: RpcConfig,
    pub log_level: String,
}

/// How to launch the engine process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub accounts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub frame_format: FrameFormat,
    pub max_frame_size: usize,
    /// Method called right after spawn; the first answer marks the engine ready.
    pub handshake_method: Option<String>,
    pub startup_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl ClientConfig {
    /// Default configuration launching the given executable.
    pub fn for_executable(executable: impl Into<String>) -> Self {
        Self {
            engine: EngineConfig {
                executable: executable.into(),
                ..EngineConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.rpc.validate()?;

        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(Error::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                valid_log_levels.join(", ")
            )));
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            engine: EngineConfig::default(),
            rpc: RpcConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Validate engine launch settings
    pub fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(Error::Validation(
                "Engine executable cannot be empty".to_string(),
            ));
        }

        if self.env.keys().any(|key| key.is_empty() || key.contains('=')) {
            return Err(Error::Validation(
                "Engine environment keys must be non-empty and must not contain '='".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: std::env::var(SERVER_PATH_ENV)
                .ok()
                .filter(|path| !path.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            accounts_dir: None,
        }
    }
}

impl RpcConfig {
    /// Validate transport settings
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(Error::Validation(
                "Max frame size must be greater than 0".to_string(),
            ));
        }

        if self.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(Error::Validation(format!(
                "Max frame size too large (max {} bytes)",
                MAX_FRAME_SIZE_LIMIT
            )));
        }

        if self.startup_timeout_ms == 0 {
            return Err(Error::Validation(
                "Startup timeout must be greater than 0".to_string(),
            ));
        }

        if self.startup_timeout_ms > MAX_STARTUP_TIMEOUT_MS {
            return Err(Error::Validation(format!(
                "Startup timeout too long (max {} ms)",
                MAX_STARTUP_TIMEOUT_MS
            )));
        }

        if self.shutdown_grace_ms > MAX_SHUTDOWN_GRACE_MS {
            return Err(Error::Validation(format!(
                "Shutdown grace period too long (max {} ms)",
                MAX_SHUTDOWN_GRACE_MS
            )));
        }

        if let Some(ref method) = self.handshake_method {
            if method.trim().is_empty() {
                return Err(Error::Validation(
                    "Handshake method cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            frame_format: FrameFormat::Lines,
            max_frame_size: 100 * 1024 * 1024, // 100 MiB
            handshake_method: Some("get_system_info".to_string()),
            startup_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}
