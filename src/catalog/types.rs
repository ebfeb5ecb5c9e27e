use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display classification of a wallpaper item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
  Mobile,
  Desktop,
  Profile,
}

impl Classification {
  pub fn as_str(&self) -> &'static str {
    match self {
      Classification::Mobile => "mobile",
      Classification::Desktop => "desktop",
      Classification::Profile => "profile",
    }
  }
}

impl std::fmt::Display for Classification {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Classification {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "mobile" => Ok(Classification::Mobile),
      "desktop" => Ok(Classification::Desktop),
      "profile" | "pp" => Ok(Classification::Profile),
      other => Err(format!(
        "unknown classification '{}' (expected mobile, desktop or profile)",
        other
      )),
    }
  }
}

/// Sort orders for derived catalog views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
  #[default]
  NewestFirst,
  OldestFirst,
  MostDownloaded,
  LeastDownloaded,
}

impl std::str::FromStr for SortOrder {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "newest" => Ok(SortOrder::NewestFirst),
      "oldest" => Ok(SortOrder::OldestFirst),
      "most-downloaded" | "popular" => Ok(SortOrder::MostDownloaded),
      "least-downloaded" => Ok(SortOrder::LeastDownloaded),
      other => Err(format!(
        "unknown sort order '{}' (expected newest, oldest, most-downloaded or least-downloaded)",
        other
      )),
    }
  }
}

/// Canonical catalog entry. Wallpapers and shop products normalize into the
/// same shape; products carry no classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub tags: Vec<String>,
  pub classification: Option<Classification>,
  /// Asset shown in grids and modals. An item without one is not displayable
  /// and is excluded upstream.
  pub image_url: String,
  /// Asset fetched on download; falls back to `image_url` when the record
  /// has no distinct download link.
  pub download_url: String,
  #[serde(default)]
  pub is_hot: bool,
  #[serde(default)]
  pub download_count_raw: u64,
  pub created_time: DateTime<Utc>,
}

impl CatalogItem {
  /// Whether the item resolves a display asset at all.
  pub fn has_image(&self) -> bool {
    !self.image_url.is_empty()
  }
}

/// Format a raw download count for display: `"0"`, plain integers below a
/// thousand, then one-decimal `K`/`M` suffixes.
pub fn format_count(count: u64) -> String {
  if count == 0 {
    "0".to_string()
  } else if count >= 1_000_000 {
    format!("{:.1}M", count as f64 / 1_000_000.0)
  } else if count >= 1_000 {
    format!("{:.1}K", count as f64 / 1_000.0)
  } else {
    count.to_string()
  }
}

/// Parse a legacy formatted count string back into a raw value
/// (`"1.5K"` -> 1500, floored). Returns `None` when unparseable.
pub fn parse_formatted_count(s: &str) -> Option<u64> {
  let s = s.trim();
  if let Some(num) = s.strip_suffix('K') {
    num.trim().parse::<f64>().ok().map(|v| (v * 1_000.0).floor() as u64)
  } else if let Some(num) = s.strip_suffix('M') {
    num.trim().parse::<f64>().ok().map(|v| (v * 1_000_000.0).floor() as u64)
  } else {
    s.parse::<u64>().ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_count_boundaries() {
    assert_eq!(format_count(0), "0");
    assert_eq!(format_count(1), "1");
    assert_eq!(format_count(999), "999");
    assert_eq!(format_count(1_000), "1.0K");
    assert_eq!(format_count(1_500), "1.5K");
    assert_eq!(format_count(999_999), "1000.0K");
    assert_eq!(format_count(1_000_000), "1.0M");
    assert_eq!(format_count(1_500_000), "1.5M");
  }

  #[test]
  fn test_parse_formatted_count() {
    assert_eq!(parse_formatted_count("0"), Some(0));
    assert_eq!(parse_formatted_count("730"), Some(730));
    assert_eq!(parse_formatted_count("1.5K"), Some(1_500));
    assert_eq!(parse_formatted_count("2M"), Some(2_000_000));
    assert_eq!(parse_formatted_count("1.25K"), Some(1_250));
    assert_eq!(parse_formatted_count("n/a"), None);
    assert_eq!(parse_formatted_count(""), None);
  }

  #[test]
  fn test_format_parse_round_trip() {
    assert_eq!(format_count(parse_formatted_count("1.5K").unwrap()), "1.5K");
    assert_eq!(format_count(parse_formatted_count("999").unwrap()), "999");
    assert_eq!(format_count(parse_formatted_count("1.5M").unwrap()), "1.5M");
  }

  #[test]
  fn test_classification_from_str() {
    assert_eq!("Mobile".parse::<Classification>(), Ok(Classification::Mobile));
    assert_eq!("pp".parse::<Classification>(), Ok(Classification::Profile));
    assert!("tablet".parse::<Classification>().is_err());
  }
}
