//! Pure view derivation over a catalog snapshot. No I/O: filtering,
//! broadening and sorting all run against the cached items.

use std::collections::HashSet;

use super::types::{CatalogItem, Classification, SortOrder};

/// Parameters for a derived view.
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
  /// Exact classification to keep; `None` keeps everything.
  pub classification: Option<Classification>,
  /// Selected tag filters, OR semantics.
  pub tags: Vec<String>,
  pub sort: SortOrder,
}

/// A derived view, flagged when the tag filter was broadened across
/// classifications to avoid an empty page.
#[derive(Debug, Clone)]
pub struct DerivedView {
  pub items: Vec<CatalogItem>,
  pub broadened: bool,
}

/// The tag vocabulary: every distinct tag across the snapshot, sorted
/// case-insensitively. Dedup is exact-string on purpose - differently-cased
/// variants are distinct labels, preserved for display.
pub fn extract_tag_vocabulary(items: &[CatalogItem]) -> Vec<String> {
  let mut seen: HashSet<&str> = HashSet::new();
  let mut tags: Vec<String> = Vec::new();

  for tag in items.iter().flat_map(|item| item.tags.iter()) {
    if tag.trim().is_empty() {
      continue;
    }
    if seen.insert(tag.as_str()) {
      tags.push(tag.clone());
    }
  }

  tags.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()));
  tags
}

/// Derive the filtered, sorted view for the given options.
///
/// When the combination of classification and tags matches nothing, the tag
/// filter is re-run against the whole snapshot so the caller can show
/// cross-category matches instead of an empty page; `broadened` reports
/// that this happened.
pub fn derive_view(all: &[CatalogItem], options: &ViewOptions) -> DerivedView {
  let type_filtered: Vec<&CatalogItem> = match options.classification {
    Some(wanted) => all
      .iter()
      .filter(|item| item.classification == Some(wanted))
      .collect(),
    None => all.iter().collect(),
  };

  let mut broadened = false;
  let mut selected: Vec<&CatalogItem> = if options.tags.is_empty() {
    type_filtered
  } else {
    let tag_filtered: Vec<&CatalogItem> = type_filtered
      .into_iter()
      .filter(|item| matches_any_tag(item, &options.tags))
      .collect();

    if tag_filtered.is_empty() && options.classification.is_some() {
      broadened = true;
      all
        .iter()
        .filter(|item| matches_any_tag(item, &options.tags))
        .collect()
    } else {
      tag_filtered
    }
  };

  sort_items(&mut selected, options.sort);

  DerivedView {
    items: selected.into_iter().cloned().collect(),
    broadened,
  }
}

/// OR semantics with case-insensitive substring matching, tolerant of
/// pluralization and compound tag text.
fn matches_any_tag(item: &CatalogItem, selected: &[String]) -> bool {
  selected.iter().any(|selected_tag| {
    let needle = selected_tag.to_lowercase();
    item
      .tags
      .iter()
      .any(|tag| tag.to_lowercase().contains(&needle))
  })
}

/// Stable sorts: equal keys keep their snapshot order.
fn sort_items(items: &mut [&CatalogItem], sort: SortOrder) {
  match sort {
    SortOrder::NewestFirst => items.sort_by(|a, b| b.created_time.cmp(&a.created_time)),
    SortOrder::OldestFirst => items.sort_by(|a, b| a.created_time.cmp(&b.created_time)),
    SortOrder::MostDownloaded => {
      items.sort_by(|a, b| b.download_count_raw.cmp(&a.download_count_raw))
    }
    SortOrder::LeastDownloaded => {
      items.sort_by(|a, b| a.download_count_raw.cmp(&b.download_count_raw))
    }
  }
}
