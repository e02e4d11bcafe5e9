//! Server Configuration
//!
//! Environment variables (optionally from `.env`) plus a JSON provider file.

use std::path::{Path, PathBuf};

use chat_core::{
    ChatSettings,
    driver::DEFAULT_MAX_ROUNDS,
    provider::{ProviderConfig, StaticProviderRegistry},
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to read provider file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse provider file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Process configuration, read once at startup
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub provider_file: PathBuf,
    pub data_dir: PathBuf,
    pub root_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub knowledge_dir: PathBuf,
    pub max_rounds: usize,
    pub safe_mode: bool,
    pub watchdog: bool,
    pub judge_model: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_rounds = match var("CHAT_MAX_ROUNDS") {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "CHAT_MAX_ROUNDS",
                    value,
                })?,
            None => DEFAULT_MAX_ROUNDS,
        };

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            provider_file: var("CHAT_CONFIG_PATH").map_or_else(|| PathBuf::from("config.json"), PathBuf::from),
            data_dir: var("CHAT_DATA_DIR").map_or_else(|| PathBuf::from("data/conversations"), PathBuf::from),
            root_path: var("CHAT_ROOT_PATH").map_or_else(|| PathBuf::from("."), PathBuf::from),
            scratch_dir: var("CHAT_SCRATCH_DIR")
                .map_or_else(|| std::env::temp_dir().join("chat-scratch"), PathBuf::from),
            knowledge_dir: var("CHAT_KNOWLEDGE_DIR").map_or_else(|| PathBuf::from("knowledge"), PathBuf::from),
            max_rounds,
            safe_mode: flag("CHAT_SAFE_MODE", var("CHAT_SAFE_MODE"), true)?,
            watchdog: flag("CHAT_WATCHDOG", var("CHAT_WATCHDOG"), true)?,
            judge_model: var("CHAT_JUDGE_MODEL"),
        })
    }

    /// Turn settings derived from this configuration
    pub fn settings(&self) -> ChatSettings {
        ChatSettings {
            max_rounds: self.max_rounds,
            safe_mode: self.safe_mode,
            watchdog: self.watchdog,
            root_path: self.root_path.clone(),
            scratch_dir: self.scratch_dir.clone(),
            judge_model: self.judge_model.clone(),
            ..ChatSettings::default()
        }
    }
}

fn flag(name: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { name, value }),
    }
}

#[derive(Deserialize)]
struct ProviderFile {
    #[serde(default)]
    providers: Vec<ProviderConfig>,
}

/// Load the provider registry; a missing file yields the built-in providers
pub fn load_providers(path: &Path) -> Result<StaticProviderRegistry, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "provider file not found, using built-in providers");
            return Ok(StaticProviderRegistry::builtin());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let file: ProviderFile = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(StaticProviderRegistry::new(file.providers))
}
