use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Credentials and endpoint for the automation engine's language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load `config.json` if present, then let the `WEBPILOT_API_KEY`
    /// environment variable override the file's engine key.
    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        if let Ok(key) = std::env::var("WEBPILOT_API_KEY") {
            if !key.trim().is_empty() {
                config.engine.api_key = key.trim().to_string();
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fail fast when no engine credential is configured. Called at startup,
    /// before any command touches the browser.
    pub fn require_api_key(&self) -> Result<&str> {
        let key = self.engine.api_key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "No engine API key configured. Set WEBPILOT_API_KEY or engine.apiKey in config.json".to_string(),
            ));
        }
        Ok(key)
    }
}
