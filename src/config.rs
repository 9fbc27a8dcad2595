use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pricing::PricingConfig;
use crate::sync::DebounceWindows;

/// Environment variable overriding `backend.url`
pub const BACKEND_URL_ENV: &str = "STORESYNC_BACKEND_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the storefront API (e.g., "http://localhost:5000/api")
  pub url: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:5000/api".to_string(),
      timeout_secs: 30,
    }
  }
}

/// Quiescence windows for debounced quantity writes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Cart line stepper
  pub cart_debounce_ms: u64,
  /// Product detail stepper
  pub detail_debounce_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      cart_debounce_ms: 3000,
      detail_debounce_ms: 1500,
    }
  }
}

impl SyncConfig {
  pub fn debounce_windows(&self) -> DebounceWindows {
    DebounceWindows {
      cart: Duration::from_millis(self.cart_debounce_ms),
      detail: Duration::from_millis(self.detail_debounce_ms),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storesync/config.yaml
  ///
  /// Without a config file the defaults are used. `STORESYNC_BACKEND_URL`
  /// overrides the backend URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
      config.backend.url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("storesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.backend.url, "http://localhost:5000/api");
    assert_eq!(config.backend.timeout_secs, 30);
    assert_eq!(config.pricing, PricingConfig::default());

    let windows = config.sync.debounce_windows();
    assert_eq!(windows, DebounceWindows::default());
  }

  #[test]
  fn test_partial_sections_keep_defaults() {
    let config = Config::parse(
      "backend:\n  url: https://shop.example.com/api\nsync:\n  cart_debounce_ms: 500\n",
    )
    .unwrap();

    assert_eq!(config.backend.url, "https://shop.example.com/api");
    assert_eq!(config.backend.timeout_secs, 30);
    assert_eq!(config.sync.cart_debounce_ms, 500);
    assert_eq!(config.sync.detail_debounce_ms, 1500);
  }

  #[test]
  fn test_pricing_section() {
    let config = Config::parse("pricing:\n  discount_rate: 0.1\n").unwrap();
    assert_eq!(config.pricing.discount_rate, 0.1);
    assert_eq!(config.pricing.delivery_fee, 15.98);
  }

  #[test]
  fn test_invalid_yaml_is_error() {
    assert!(Config::parse("sync:\n  cart_debounce_ms: soon\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/storesync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
