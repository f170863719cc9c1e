use color_eyre::{eyre::eyre, Result};
use crudkit::table::ColumnConfig;
use crudkit::CachePreset;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TOKEN_VAR: &str = "CRUDKIT_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
  /// Entities by the name used on the command line
  #[serde(default)]
  pub entities: BTreeMap<String, EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  /// Process-local, gone when the command exits
  #[default]
  Memory,
  /// SQLite file shared between invocations
  Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub backend: CacheBackend,
  /// SQLite file (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Write daily log files here instead of stderr
  pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
  /// Resource path relative to `api.base_url`
  pub path: String,
  #[serde(default = "default_identifier_fields")]
  pub identifier_fields: Vec<String>,
  #[serde(default)]
  pub preset: CachePreset,
  #[serde(default)]
  pub columns: Vec<ColumnConfig>,
  #[serde(default = "default_true")]
  pub include_audit_fields: bool,
}

fn default_identifier_fields() -> Vec<String> {
  vec!["id".to_string()]
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./crudkit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/crudkit/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/crudkit/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("crudkit.yaml");
    if local.exists() {
      return Some(local);
    }

    dirs::config_dir()
      .map(|dir| dir.join("crudkit").join("config.yaml"))
      .filter(|path| path.exists())
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn entity(&self, name: &str) -> Result<&EntityConfig> {
    self.entities.get(name).ok_or_else(|| {
      let known: Vec<&str> = self.entities.keys().map(String::as_str).collect();
      eyre!(
        "Unknown entity `{}`. Configured entities: {}",
        name,
        if known.is_empty() {
          "none".to_string()
        } else {
          known.join(", ")
        }
      )
    })
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Bearer token from CRUDKIT_API_TOKEN, if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var(TOKEN_VAR).ok().filter(|t| !t.is_empty())
  }
}
