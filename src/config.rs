use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::catalog::types::Classification;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub provider: ProviderConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub classify: ClassifyRules,
}

/// Connection details for the hosted table service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
  /// API root of the table service.
  pub api_url: String,
  /// Workspace (base) identifier.
  pub base: String,
  pub wallpapers_table: String,
  pub products_table: String,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      api_url: "https://api.airtable.com/v0".to_string(),
      base: String::new(),
      wallpapers_table: "Wallpapers".to_string(),
      products_table: "Products".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Snapshot time-to-live in minutes.
  pub ttl_minutes: i64,
  /// Override for the cache database location.
  pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_minutes: 5,
      db_path: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.ttl_minutes)
  }
}

/// Classification rules. The keyword lists are tuned to the live table's
/// inconsistent data entry, so they are configuration rather than code; the
/// defaults mirror the values observed in production.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifyRules {
  /// Exact `Type` column values with a known classification.
  pub type_map: HashMap<String, Classification>,
  /// Tag keywords implying a profile picture (compared lowercase).
  pub profile_tags: Vec<String>,
  /// Tag keywords implying a desktop wallpaper.
  pub desktop_tags: Vec<String>,
  /// Tag keywords implying a mobile wallpaper.
  pub mobile_tags: Vec<String>,
  /// `Type` values the remote profile filter ORs together.
  pub profile_synonyms: Vec<String>,
}

impl Default for ClassifyRules {
  fn default() -> Self {
    let mut type_map = HashMap::new();
    type_map.insert("Mobile".to_string(), Classification::Mobile);
    type_map.insert("Desktop".to_string(), Classification::Desktop);
    type_map.insert("Profile Picture".to_string(), Classification::Profile);
    type_map.insert("Profile".to_string(), Classification::Profile);
    type_map.insert("PP".to_string(), Classification::Profile);

    Self {
      type_map,
      profile_tags: to_strings(&["pp", "profile", "profile picture", "avatar"]),
      desktop_tags: to_strings(&["desktop", "pc", "computer", "wallpaper"]),
      mobile_tags: to_strings(&["mobile", "phone", "smartphone"]),
      profile_synonyms: to_strings(&["PP", "Profile", "Profile Picture"]),
    }
  }
}

impl ClassifyRules {
  /// Look up an explicit `Type` column value. Exact match only; keyword
  /// inference from tags is the normalizer's fallback.
  pub fn lookup_type(&self, value: &str) -> Option<Classification> {
    self.type_map.get(value).copied()
  }
}

fn to_strings(values: &[&str]) -> Vec<String> {
  values.iter().map(|s| s.to_string()).collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mural.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mural/config.yaml
  /// 4. ~/.config/mural/config.yaml
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
        "No configuration file found. Create one at ~/.config/mural/config.yaml\n\
                 with at least the provider base id."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mural.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mural").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    if config.provider.base.is_empty() {
      return Err(eyre!(
        "Config file {} does not set provider.base",
        path.display()
      ));
    }

    Ok(config)
  }

  /// Get the provider API token from environment variables.
  ///
  /// Checks MURAL_API_KEY first, then AIRTABLE_API_KEY as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("MURAL_API_KEY")
      .or_else(|_| std::env::var("AIRTABLE_API_KEY"))
      .map_err(|_| {
        eyre!(
          "Provider API token not found. Set MURAL_API_KEY or AIRTABLE_API_KEY environment variable."
        )
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_rules_map_known_type_values() {
    let rules = ClassifyRules::default();
    assert_eq!(rules.lookup_type("Mobile"), Some(Classification::Mobile));
    assert_eq!(rules.lookup_type("PP"), Some(Classification::Profile));
    assert_eq!(
      rules.lookup_type("Profile Picture"),
      Some(Classification::Profile)
    );
    assert_eq!(rules.lookup_type("Tablet"), None);
    // Lookup is exact-match; lowercase variants fall through to inference.
    assert_eq!(rules.lookup_type("mobile"), None);
  }

  #[test]
  fn test_config_parses_partial_yaml() {
    let config: Config = serde_yaml::from_str(
      "provider:\n  base: appXYZ\ncache:\n  ttl_minutes: 10\n",
    )
    .unwrap();
    assert_eq!(config.provider.base, "appXYZ");
    assert_eq!(config.provider.wallpapers_table, "Wallpapers");
    assert_eq!(config.cache.ttl(), chrono::Duration::minutes(10));
    assert!(!config.classify.profile_tags.is_empty());
  }
}
