//! Cache bindings for catalog types.

use sha2::{Digest, Sha256};

use crate::cache::{Cacheable, QueryKey};

use super::types::CatalogItem;

impl Cacheable for CatalogItem {
  fn entity_type() -> &'static str {
    "catalog_item"
  }
}

/// Logical cache keys: one per distinct fetch parameterization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogQueryKey {
  /// The full wallpapers table. Fetched unfiltered so one snapshot serves
  /// every classification view; filtering happens locally.
  Wallpapers,
  /// The shop products table.
  Products,
}

impl QueryKey for CatalogQueryKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::Wallpapers => "wallpapers:all",
      Self::Products => "products:all",
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::Wallpapers => "all wallpapers".to_string(),
      Self::Products => "shop products".to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_hash_to_distinct_stable_values() {
    let wallpapers = CatalogQueryKey::Wallpapers.cache_hash();
    assert_eq!(wallpapers, CatalogQueryKey::Wallpapers.cache_hash());
    assert_ne!(wallpapers, CatalogQueryKey::Products.cache_hash());
    // Fixed-length hex, safe as a storage key
    assert_eq!(wallpapers.len(), 64);
  }
}
