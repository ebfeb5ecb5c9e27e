//! The catalog service: gateway, normalizer, snapshot cache, count store
//! and view projection wired together behind one facade.
//!
//! Construct one service at startup and share it by reference; every cache
//! and count structure inside has process lifetime with no teardown.

use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheLayer, CacheStorage, LoadError};
use crate::config::{ClassifyRules, Config};
use crate::query::Query;

use super::api_types::{normalize_products, normalize_wallpapers};
use super::cache::CatalogQueryKey;
use super::client::CatalogClient;
use super::counts::{CountStore, CountWatch, IncrementOutcome};
use super::types::{CatalogItem, SortOrder};
use super::view::{derive_view, extract_tag_vocabulary, ViewOptions};

/// Everything a catalog page needs to render.
#[derive(Debug, Clone)]
pub struct CatalogView {
  pub items: Vec<CatalogItem>,
  /// Tag vocabulary of the whole snapshot, independent of active filters.
  pub tag_vocabulary: Vec<String>,
  /// True when the tag filter matched nothing in the requested
  /// classification and was re-run across the whole catalog.
  pub broadened: bool,
}

pub struct CatalogService<S: CacheStorage> {
  client: CatalogClient,
  cache: CacheLayer<CatalogItem, S>,
  counts: Arc<CountStore>,
  rules: ClassifyRules,
}

impl<S: CacheStorage> CatalogService<S> {
  pub fn new(config: &Config, api_key: String, storage: S) -> Self {
    let client = CatalogClient::new(config, api_key);

    let sync_client = client.clone();
    let counts = Arc::new(CountStore::new(move |id, current| {
      let client = sync_client.clone();
      async move { client.update_count(&id, current).await }
    }));

    Self {
      client,
      cache: CacheLayer::new(storage).with_ttl(config.cache.ttl()),
      counts,
      rules: config.classify.clone(),
    }
  }

  /// Start the background TTL sweep. Call once from an async context.
  pub fn start_expiry_sweeper(&self) {
    let _ = self
      .cache
      .spawn_expiry_sweeper(std::time::Duration::from_secs(60));
  }

  /// The full wallpaper snapshot (memory, then session store, then
  /// network). Obtaining a snapshot seeds the count projection for every
  /// id not yet seen.
  pub async fn wallpapers(&self) -> Result<Arc<Vec<CatalogItem>>, LoadError> {
    let client = self.client.clone();
    let rules = self.rules.clone();

    let result = self
      .cache
      .get(&CatalogQueryKey::Wallpapers, move || async move {
        let records = client.fetch_wallpapers(None).await.map_err(LoadError::from)?;
        Ok(normalize_wallpapers(records, &rules).items)
      })
      .await?;

    self.counts.seed(&result.items);
    debug!(
      count = result.items.len(),
      source = ?result.source,
      fetched_at = %result.fetched_at,
      "wallpaper snapshot resolved"
    );
    Ok(result.items)
  }

  /// The full product snapshot.
  pub async fn products(&self) -> Result<Arc<Vec<CatalogItem>>, LoadError> {
    let client = self.client.clone();

    let result = self
      .cache
      .get(&CatalogQueryKey::Products, move || async move {
        let records = client.fetch_products().await.map_err(LoadError::from)?;
        Ok(normalize_products(records).items)
      })
      .await?;

    self.counts.seed(&result.items);
    debug!(
      count = result.items.len(),
      source = ?result.source,
      fetched_at = %result.fetched_at,
      "product snapshot resolved"
    );
    Ok(result.items)
  }

  /// Filtered, sorted wallpaper view plus the tag vocabulary.
  pub async fn catalog_view(&self, options: &ViewOptions) -> Result<CatalogView, LoadError> {
    let all = self.wallpapers().await?;
    let derived = derive_view(&all, options);
    if derived.broadened {
      info!(tags = ?options.tags, "tag filter broadened across classifications");
    }

    Ok(CatalogView {
      tag_vocabulary: extract_tag_vocabulary(&all),
      items: derived.items,
      broadened: derived.broadened,
    })
  }

  /// Shop view; products have no classification dimension.
  pub async fn shop_view(&self, tags: &[String], sort: SortOrder) -> Result<CatalogView, LoadError> {
    let all = self.products().await?;
    let options = ViewOptions {
      classification: None,
      tags: tags.to_vec(),
      sort,
    };
    let derived = derive_view(&all, &options);

    Ok(CatalogView {
      tag_vocabulary: extract_tag_vocabulary(&all),
      items: derived.items,
      broadened: derived.broadened,
    })
  }

  /// Drop cached wallpaper state and load fresh from the network.
  pub async fn refetch_wallpapers(&self) -> Result<Arc<Vec<CatalogItem>>, LoadError> {
    self.cache.invalidate(&CatalogQueryKey::Wallpapers);
    self.wallpapers().await
  }

  /// Drop cached product state and load fresh from the network.
  pub async fn refetch_products(&self) -> Result<Arc<Vec<CatalogItem>>, LoadError> {
    self.cache.invalidate(&CatalogQueryKey::Products);
    self.products().await
  }

  /// The shared count projection.
  pub fn counts(&self) -> &Arc<CountStore> {
    &self.counts
  }

  /// Record a download: optimistic bump plus remote reconcile.
  pub async fn record_download(&self, id: &str) -> IncrementOutcome {
    self.counts.increment(id).await
  }

  /// Live count cell for one item.
  pub fn watch_count(&self, id: &str) -> CountWatch {
    self.counts.watch(id)
  }
}

impl<S: CacheStorage> CatalogService<S> {
  /// A poll-based query handle over the wallpaper view, for consumers that
  /// render loading and error states. Clones share all cache and count
  /// state, so handles stay coherent with the service.
  pub fn view_query(&self, options: ViewOptions) -> Query<CatalogView> {
    let service = self.clone();
    Query::new(move || {
      let service = service.clone();
      let options = options.clone();
      async move { service.catalog_view(&options).await }
    })
  }

  /// A poll-based query handle over the shop view.
  pub fn shop_query(&self, tags: Vec<String>, sort: SortOrder) -> Query<CatalogView> {
    let service = self.clone();
    Query::new(move || {
      let service = service.clone();
      let tags = tags.clone();
      async move { service.shop_view(&tags, sort).await }
    })
  }
}

impl<S: CacheStorage> Clone for CatalogService<S> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      cache: self.cache.clone(),
      counts: Arc::clone(&self.counts),
      rules: self.rules.clone(),
    }
  }
}
