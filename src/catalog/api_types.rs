//! Serde-deserializable types matching the remote table API responses.
//!
//! These types are separate from domain types so the provider's loose
//! field bag never leaks past normalization. Every field degrades to a
//! default: normalization is total, and only the validity filter below
//! drops records.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ClassifyRules;

use super::types::{parse_formatted_count, CatalogItem, Classification};

/// One page of records from the list endpoint.
#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
  #[serde(default = "Vec::new")]
  pub records: Vec<T>,
  /// Continuation token; present while more pages remain.
  #[serde(default)]
  pub offset: Option<String>,
}

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttachment {
  #[serde(default)]
  pub url: String,
  #[serde(default)]
  pub thumbnails: Option<RawThumbnails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawThumbnails {
  #[serde(default)]
  pub full: Option<RawThumbnail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawThumbnail {
  #[serde(default)]
  pub url: String,
}

/// Single- and multi-select columns arrive as either a string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
  One(String),
  Many(Vec<String>),
}

impl OneOrMany {
  fn first(&self) -> Option<&str> {
    match self {
      OneOrMany::One(value) => Some(value),
      OneOrMany::Many(values) => values.first().map(String::as_str),
    }
  }
}

// ============================================================================
// Wallpaper records
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct RawWallpaperFields {
  #[serde(rename = "Name", default)]
  pub name: Option<String>,
  #[serde(rename = "Tags", default)]
  pub tags: Vec<String>,
  #[serde(rename = "Image", default)]
  pub image: Vec<RawAttachment>,
  #[serde(rename = "Type", default)]
  pub record_type: Option<OneOrMany>,
  #[serde(rename = "Download Link", default)]
  pub download_link: Option<String>,
  #[serde(rename = "Is Hot", default)]
  pub is_hot: bool,
  #[serde(rename = "Download Count", default)]
  pub download_count: Option<String>,
  #[serde(rename = "Download Count Raw", default)]
  pub download_count_raw: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawRecord {
  pub id: String,
  #[serde(rename = "createdTime", default)]
  pub created_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub fields: RawWallpaperFields,
}

// ============================================================================
// Product records
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct RawProductFields {
  #[serde(rename = "Name", default)]
  pub name: Option<String>,
  #[serde(rename = "Tags", default)]
  pub tags: Vec<String>,
  #[serde(rename = "Image Link", default)]
  pub image_link: Option<String>,
  #[serde(rename = "Link", default)]
  pub link: Option<String>,
  #[serde(rename = "Is Hot", default)]
  pub is_hot: bool,
  #[serde(rename = "Trending", default)]
  pub trending: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawProductRecord {
  pub id: String,
  #[serde(rename = "createdTime", default)]
  pub created_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub fields: RawProductFields,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl RawRecord {
  /// Normalize into the canonical item. Total: missing or malformed fields
  /// degrade to defaults; the caller applies the validity filter.
  pub fn into_item(self, rules: &ClassifyRules) -> CatalogItem {
    let f = self.fields;

    // Prefer the full-size thumbnail over the raw attachment URL.
    let image_url = f
      .image
      .first()
      .map(|attachment| {
        attachment
          .thumbnails
          .as_ref()
          .and_then(|t| t.full.as_ref())
          .map(|full| full.url.clone())
          .unwrap_or_else(|| attachment.url.clone())
      })
      .unwrap_or_default();

    let download_url = f
      .download_link
      .filter(|link| !link.is_empty())
      .unwrap_or_else(|| image_url.clone());

    let classification = classify(
      f.record_type.as_ref().and_then(OneOrMany::first),
      &f.tags,
      rules,
    );

    let download_count_raw = f
      .download_count_raw
      .or_else(|| f.download_count.as_deref().and_then(parse_formatted_count))
      .unwrap_or(0);

    CatalogItem {
      id: self.id,
      name: f
        .name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Untitled Wallpaper".to_string()),
      tags: f.tags,
      classification: Some(classification),
      image_url,
      download_url,
      is_hot: f.is_hot,
      download_count_raw,
      created_time: self.created_time.unwrap_or(DateTime::UNIX_EPOCH),
    }
  }
}

impl RawProductRecord {
  /// Normalize a shop product. Products carry no classification and no
  /// count fields; the outbound shop link doubles as the download asset.
  pub fn into_item(self) -> CatalogItem {
    let f = self.fields;
    let image_url = f.image_link.unwrap_or_default();
    let download_url = f
      .link
      .filter(|link| !link.is_empty())
      .unwrap_or_else(|| image_url.clone());

    CatalogItem {
      id: self.id,
      name: f
        .name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Untitled Product".to_string()),
      tags: f.tags,
      classification: None,
      image_url,
      download_url,
      is_hot: f.trending || f.is_hot,
      download_count_raw: 0,
      created_time: self.created_time.unwrap_or(DateTime::UNIX_EPOCH),
    }
  }
}

/// Classification inference. The explicit lookup table wins; otherwise the
/// tag keyword groups decide, profile before desktop before mobile, with
/// `mobile` as the last resort. Heuristic - upstream data entry is
/// inconsistent, not guaranteed.
fn classify(
  type_value: Option<&str>,
  tags: &[String],
  rules: &ClassifyRules,
) -> Classification {
  if let Some(value) = type_value {
    if let Some(classification) = rules.lookup_type(value) {
      return classification;
    }
  }

  let tags_match = |keywords: &[String]| {
    tags
      .iter()
      .any(|tag| keywords.iter().any(|k| *k == tag.to_lowercase()))
  };

  let groups = [
    (&rules.profile_tags, Classification::Profile),
    (&rules.desktop_tags, Classification::Desktop),
    (&rules.mobile_tags, Classification::Mobile),
  ];
  for (keywords, classification) in groups {
    if tags_match(keywords) {
      return classification;
    }
  }

  Classification::Mobile
}

// ============================================================================
// Normalization entry points
// ============================================================================

/// Result of normalizing a raw batch: the displayable items plus how many
/// records the validity filter dropped.
#[derive(Debug)]
pub struct NormalizedBatch {
  pub items: Vec<CatalogItem>,
  pub excluded: usize,
}

/// Normalize a wallpaper batch and drop records without a display asset.
pub fn normalize_wallpapers(records: Vec<RawRecord>, rules: &ClassifyRules) -> NormalizedBatch {
  filter_valid(
    records
      .into_iter()
      .map(|record| record.into_item(rules))
      .collect(),
  )
}

/// Normalize a product batch and drop records without a display asset.
pub fn normalize_products(records: Vec<RawProductRecord>) -> NormalizedBatch {
  filter_valid(records.into_iter().map(RawProductRecord::into_item).collect())
}

/// The validity invariant: an item with no resolvable display asset cannot
/// be rendered or downloaded, so it never reaches a returned collection.
/// Exclusions are counted and logged rather than silently dropped.
fn filter_valid(items: Vec<CatalogItem>) -> NormalizedBatch {
  let total = items.len();
  let mut excluded = 0usize;
  let items: Vec<CatalogItem> = items
    .into_iter()
    .filter(|item| {
      if item.has_image() {
        true
      } else {
        excluded += 1;
        debug!(id = %item.id, name = %item.name, "dropping record without display asset");
        false
      }
    })
    .collect();

  if excluded > 0 {
    warn!(excluded, total, "records without display assets were excluded");
  }

  NormalizedBatch { items, excluded }
}
