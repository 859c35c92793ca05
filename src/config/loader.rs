//! Configuration Loader
//!
//! Loads and merges relay configuration from built-in defaults and config files.

use crate::config::relay::RelayConfig;
use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    config: RelayConfig,
}

impl ConfigLoader {
    /// Create a new config loader and load from default locations
    pub fn new() -> Result<Self> {
        // Pick up KEYRELAY_* variables from a local .env before reading paths
        let _ = dotenvy::dotenv();

        let mut loader = Self {
            config: RelayConfig::default(),
        };

        loader.load_builtin_defaults()?;
        loader.load_from_default_paths()?;
        loader.config.validate()?;

        Ok(loader)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self {
            config: RelayConfig::default(),
        };

        loader.load_builtin_defaults()?;
        loader.load_from_file(path)?;
        loader.config.validate()?;

        Ok(loader)
    }

    /// Load built-in provider defaults
    fn load_builtin_defaults(&mut self) -> Result<()> {
        let defaults = include_str!("../../providers.json");
        let config: RelayConfig = serde_json::from_str(defaults).map_err(|e| {
            RelayError::Config(format!("Failed to parse built-in providers.json: {}", e))
        })?;

        self.merge_config(config);
        Ok(())
    }

    /// Load configuration from default paths
    fn load_from_default_paths(&mut self) -> Result<()> {
        for path in Self::get_config_paths() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading relay config");
                self.load_from_file(&path)?;
            }
        }

        Ok(())
    }

    /// Get list of config paths to check, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".keyrelay").join("config.json"));
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("keyrelay").join("config.json"));
        }

        paths.push(PathBuf::from("keyrelay.json"));

        if let Ok(custom_path) = std::env::var("KEYRELAY_CONFIG") {
            paths.push(PathBuf::from(custom_path));
        }

        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: RelayConfig = serde_json::from_str(&content).map_err(|e| {
            RelayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        self.merge_config(config);
        Ok(())
    }

    /// Merge another config into this one (later configs override earlier)
    fn merge_config(&mut self, other: RelayConfig) {
        // Engine and vault sections replace wholesale; serde fills unspecified fields
        // with defaults, so only a file that mentions them should win.
        let engine_overridden = other.engine_overridden();
        let vault_overridden = other.vault_overridden();

        self.config.providers.extend(other.providers);
        self.config.model_types.extend(other.model_types);
        self.config.special_models.extend(other.special_models);
        self.config.fallback_chains.extend(other.fallback_chains);

        if engine_overridden {
            self.config.engine = other.engine;
        }
        if vault_overridden {
            self.config.vault = other.vault;
        }
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Take ownership of the configuration
    pub fn into_config(self) -> RelayConfig {
        self.config
    }
}

impl RelayConfig {
    fn engine_overridden(&self) -> bool {
        serde_json::to_value(&self.engine).ok()
            != serde_json::to_value(crate::config::EngineSettings::default()).ok()
    }

    fn vault_overridden(&self) -> bool {
        serde_json::to_value(&self.vault).ok()
            != serde_json::to_value(crate::config::VaultSettings::default()).ok()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            config: RelayConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_builtin_defaults() {
        let mut loader = ConfigLoader {
            config: RelayConfig::default(),
        };
        loader.load_builtin_defaults().unwrap();
        assert!(loader.config().providers.contains_key("openai"));
    }

    #[test]
    fn test_load_from_custom_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "providers": {{
                    "custom_provider": {{
                        "base_url": "https://custom.api.com/v1",
                        "models": ["custom-model"]
                    }}
                }},
                "special_models": {{ "fast": "custom-model" }},
                "engine": {{ "request_timeout_ms": 2500 }}
            }}"#
        )
        .unwrap();

        let loader = ConfigLoader::from_path(file.path()).unwrap();
        let config = loader.config();
        assert!(config.providers.contains_key("custom_provider"));
        assert!(config.providers.contains_key("openai"));
        assert_eq!(config.special_models["fast"], "custom-model");
        assert_eq!(config.engine.request_timeout_ms, 2500);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();

        assert!(matches!(
            ConfigLoader::from_path(file.path()),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_merge_configs() {
        let mut loader = ConfigLoader {
            config: RelayConfig::default(),
        };
        loader.load_builtin_defaults().unwrap();
        let initial_count = loader.config().providers.len();

        let custom = RelayConfig::default()
            .with_provider("new_provider", ProviderSettings::new("https://new.api.com"))
            .with_chain("chat", ["a", "b"]);

        loader.merge_config(custom);
        assert_eq!(loader.config().providers.len(), initial_count + 1);
        assert_eq!(loader.config().fallback_chains["chat"], vec!["a", "b"]);
        assert_eq!(loader.config().engine.request_timeout_ms, 60_000);
    }

    #[test]
    fn test_later_file_without_engine_keeps_earlier_engine() {
        let mut loader = ConfigLoader {
            config: RelayConfig::default(),
        };
        let mut tuned = RelayConfig::default();
        tuned.engine.request_timeout_ms = 2500;
        tuned.vault.kdf_iterations = 1_000;
        loader.merge_config(tuned);

        loader.merge_config(RelayConfig::default().with_alias("fast", "gpt-4o-mini"));
        assert_eq!(loader.config().engine.request_timeout_ms, 2500);
        assert_eq!(loader.config().vault.kdf_iterations, 1_000);
        assert_eq!(loader.config().special_models["fast"], "gpt-4o-mini");
    }
}
