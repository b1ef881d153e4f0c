//! YAML configuration file for the proxy process.
//!
//! Shape follows spec.md §6: `server.{proxy_port, web_port, bind_ip}`,
//! `security.{enabled, api_token, allowed_ips[]}`, `logging.{level, console,
//! file}`, `rules.{file}`. Grounded on `oisp-core::config::ConfigLoader`'s
//! discovery order and per-section `#[serde(default)]` structs, ported from
//! TOML to YAML per spec.md's explicit mandate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub security: SecuritySettings,
    pub logging: LoggingSettings,
    pub rules: RulesSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            security: SecuritySettings::default(),
            logging: LoggingSettings::default(),
            rules: RulesSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub proxy_port: u16,
    pub web_port: u16,
    pub bind_ip: String,
    /// Substrings of a CONNECT host that trigger MITM instead of splice
    /// (spec.md §9's open question: the reference `shouldMitm` predicate is
    /// configuration-driven here rather than hard-coded).
    pub mitm_hosts: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            proxy_port: 2021,
            web_port: 2022,
            bind_ip: "0.0.0.0".to_string(),
            mitm_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub enabled: bool,
    pub api_token: String,
    pub allowed_ips: Vec<String>,
}

impl Default for SecuritySettings {
    // The fallback-on-missing-file path mirrors the original's `Default()`
    // (security disabled), not its embedded zero-value-before-overlay
    // defaults (security enabled, token "changeme") — see DESIGN.md.
    fn default() -> Self {
        Self {
            enabled: false,
            api_token: String::new(),
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub console: bool,
    pub file: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesSettings {
    pub file: String,
}

impl Default for RulesSettings {
    fn default() -> Self {
        Self {
            file: "rules.json".to_string(),
        }
    }
}

/// Locates and parses `configs/config.yaml` (or an operator-supplied path),
/// falling back to [`AppConfig::default`] on any failure per spec.md §7's
/// `ConfigInvalid` policy ("log and fall back to defaults").
pub struct ConfigLoader {
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Search order: CLI `--config` flag, `WARDEN_CONFIG` env var, the
    /// conventional `configs/config.yaml` relative to the working directory.
    pub fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(path = %path.display(), "--config path does not exist");
        }

        if let Ok(env_path) = std::env::var("WARDEN_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!(path = %env_path, "WARDEN_CONFIG path does not exist");
        }

        let default_path = PathBuf::from("configs/config.yaml");
        if default_path.exists() {
            return Some(default_path);
        }

        None
    }

    pub fn load(&self) -> AppConfig {
        match self.find_config_file() {
            Some(path) => match Self::load_from_file(&path) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "config parse failed, falling back to defaults");
                    AppConfig::default()
                }
            },
            None => {
                debug!("no config file found, using defaults");
                AppConfig::default()
            }
        }
    }

    fn load_from_file(path: &Path) -> Result<AppConfig, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::new().with_cli_path(Some(PathBuf::from("/does/not/exist.yaml")));
        let config = loader.load();
        assert_eq!(config.server.proxy_port, 2021);
        assert!(!config.security.enabled);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "not: [valid yaml").unwrap();
        let loader = ConfigLoader::new().with_cli_path(Some(path));
        let config = loader.load();
        assert_eq!(config.server.proxy_port, 2021);
    }

    #[test]
    fn parses_a_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
server:
  proxy_port: 9000
  web_port: 9001
  bind_ip: 127.0.0.1
  mitm_hosts:
    - example.internal
security:
  enabled: true
  api_token: secret
  allowed_ips:
    - "*"
logging:
  level: debug
  console: false
rules:
  file: custom-rules.json
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new().with_cli_path(Some(path));
        let config = loader.load();
        assert_eq!(config.server.proxy_port, 9000);
        assert_eq!(config.server.mitm_hosts, vec!["example.internal".to_string()]);
        assert!(config.security.enabled);
        assert_eq!(config.security.api_token, "secret");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.rules.file, "custom-rules.json");
    }
}
