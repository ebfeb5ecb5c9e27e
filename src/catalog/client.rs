//! HTTP gateway to the hosted record tables.

use reqwest::StatusCode;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::cache::LoadError;
use crate::config::Config;

use super::api_types::{ListResponse, RawProductRecord, RawRecord};
use super::types::Classification;

/// Typed gateway failures. `Status` carries the provider's response so
/// callers can surface it; `Network` is a transport-level failure.
#[derive(Debug, Error)]
pub enum GatewayError {
  #[error("catalog API error {status}: {body}")]
  Status { status: StatusCode, body: String },
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),
  #[error("invalid endpoint URL: {0}")]
  Url(#[from] url::ParseError),
}

impl From<GatewayError> for LoadError {
  fn from(err: GatewayError) -> Self {
    let status = match &err {
      GatewayError::Status { status, .. } => Some(status.as_u16()),
      _ => None,
    };
    LoadError {
      status,
      message: err.to_string(),
    }
  }
}

/// Client for the provider's list and update endpoints.
#[derive(Clone)]
pub struct CatalogClient {
  http: reqwest::Client,
  api_url: String,
  base: String,
  wallpapers_table: String,
  products_table: String,
  profile_synonyms: Vec<String>,
  api_key: String,
}

impl CatalogClient {
  pub fn new(config: &Config, api_key: String) -> Self {
    Self {
      http: reqwest::Client::new(),
      api_url: config.provider.api_url.trim_end_matches('/').to_string(),
      base: config.provider.base.clone(),
      wallpapers_table: config.provider.wallpapers_table.clone(),
      products_table: config.provider.products_table.clone(),
      profile_synonyms: config.classify.profile_synonyms.clone(),
      api_key,
    }
  }

  /// Fetch every wallpaper record, following the continuation token until
  /// the provider stops returning one.
  pub async fn fetch_wallpapers(
    &self,
    filter: Option<Classification>,
  ) -> Result<Vec<RawRecord>, GatewayError> {
    let formula = filter.map(|f| self.filter_formula(f));
    debug!(?filter, ?formula, "fetching wallpaper records");

    let records = fetch_paged(|offset| {
      self.fetch_page::<RawRecord>(&self.wallpapers_table, formula.as_deref(), offset)
    })
    .await?;

    debug!(count = records.len(), "wallpaper fetch complete");
    Ok(records)
  }

  /// Fetch every product record.
  pub async fn fetch_products(&self) -> Result<Vec<RawProductRecord>, GatewayError> {
    debug!("fetching product records");
    let records =
      fetch_paged(|offset| self.fetch_page::<RawProductRecord>(&self.products_table, None, offset))
        .await?;

    debug!(count = records.len(), "product fetch complete");
    Ok(records)
  }

  /// Push an incremented download count for a record.
  ///
  /// Returns the authoritative value on success. A rejected update
  /// (non-2xx) returns `current` unchanged so the caller can detect that
  /// nothing happened; only transport failures error.
  pub async fn update_count(&self, id: &str, current: u64) -> Result<u64, GatewayError> {
    let attempted = current + 1;
    let url = self.record_url(&self.wallpapers_table, id)?;
    let body = serde_json::json!({ "fields": { "Download Count Raw": attempted } });

    debug!(%id, current, attempted, "pushing download count");
    let response = self
      .http
      .patch(url)
      .bearer_auth(&self.api_key)
      .json(&body)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      warn!(%id, %status, body = %text, "count update rejected, keeping previous value");
      return Ok(current);
    }

    // Prefer the count the provider echoes back; under contention it may
    // differ from the one we pushed.
    let authoritative = match response.json::<RawRecord>().await {
      Ok(record) => record.fields.download_count_raw.unwrap_or(attempted),
      Err(err) => {
        warn!(%id, error = %err, "unparseable update response, assuming attempted value");
        attempted
      }
    };
    Ok(authoritative)
  }

  async fn fetch_page<T: serde::de::DeserializeOwned>(
    &self,
    table: &str,
    formula: Option<&str>,
    offset: Option<String>,
  ) -> Result<ListResponse<T>, GatewayError> {
    let mut url = self.list_url(table)?;
    {
      let mut pairs = url.query_pairs_mut();
      if let Some(formula) = formula {
        pairs.append_pair("filterByFormula", formula);
      }
      if let Some(offset) = offset.as_deref() {
        pairs.append_pair("offset", offset);
      }
    }

    let response = self
      .http
      .get(url)
      .bearer_auth(&self.api_key)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(GatewayError::Status { status, body });
    }

    Ok(response.json().await?)
  }

  fn list_url(&self, table: &str) -> Result<Url, GatewayError> {
    Ok(Url::parse(&format!(
      "{}/{}/{}",
      self.api_url, self.base, table
    ))?)
  }

  fn record_url(&self, table: &str, id: &str) -> Result<Url, GatewayError> {
    Ok(Url::parse(&format!(
      "{}/{}/{}/{}",
      self.api_url, self.base, table, id
    ))?)
  }

  /// Translate a logical classification filter into the provider's formula
  /// language. Profile matches any of the configured synonym values.
  fn filter_formula(&self, filter: Classification) -> String {
    match filter {
      Classification::Mobile => find_clause("Mobile"),
      Classification::Desktop => find_clause("Desktop"),
      Classification::Profile => {
        let clauses: Vec<String> = self
          .profile_synonyms
          .iter()
          .map(|synonym| find_clause(synonym))
          .collect();
        format!("OR({})", clauses.join(", "))
      }
    }
  }
}

fn find_clause(value: &str) -> String {
  format!(r#"FIND("{}", ARRAYJOIN({{Type}}, ",")) > 0"#, value)
}

/// Concatenate pages until no continuation token is returned. The page
/// fetch is injected so the loop does not assume a fixed page count and is
/// testable in isolation.
async fn fetch_paged<T, F, Fut>(mut fetch_page: F) -> Result<Vec<T>, GatewayError>
where
  F: FnMut(Option<String>) -> Fut,
  Fut: Future<Output = Result<ListResponse<T>, GatewayError>>,
{
  let mut all = Vec::new();
  let mut offset: Option<String> = None;

  loop {
    let page = fetch_page(offset.take()).await?;
    all.extend(page.records);
    match page.offset {
      Some(next) => {
        debug!(fetched = all.len(), "more records available, following offset");
        offset = Some(next);
      }
      None => break,
    }
  }

  Ok(all)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn page(records: &[u32], offset: Option<&str>) -> ListResponse<u32> {
    ListResponse {
      records: records.to_vec(),
      offset: offset.map(String::from),
    }
  }

  #[tokio::test]
  async fn test_pagination_follows_continuation_tokens() {
    let mut pages = vec![
      page(&[1, 2], Some("p2")),
      page(&[3, 4], Some("p3")),
      page(&[5, 6], None),
    ]
    .into_iter();
    let mut seen_offsets: Vec<Option<String>> = Vec::new();

    let records = fetch_paged(|offset| {
      seen_offsets.push(offset.clone());
      let page = pages.next().expect("fetched past the last page");
      async move { Ok(page) }
    })
    .await
    .unwrap();

    assert_eq!(records, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
      seen_offsets,
      vec![None, Some("p2".to_string()), Some("p3".to_string())]
    );
  }

  #[tokio::test]
  async fn test_single_page_fetch() {
    let records = fetch_paged(|_offset| async { Ok(page(&[7], None)) })
      .await
      .unwrap();
    assert_eq!(records, vec![7]);
  }

  #[tokio::test]
  async fn test_page_error_propagates() {
    let result: Result<Vec<u32>, _> = fetch_paged(|_offset| async {
      Err(GatewayError::Status {
        status: StatusCode::UNAUTHORIZED,
        body: "bad token".to_string(),
      })
    })
    .await;

    match result {
      Err(GatewayError::Status { status, .. }) => assert_eq!(status, StatusCode::UNAUTHORIZED),
      other => panic!("expected status error, got {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn test_filter_formula_translation() {
    let client = CatalogClient::new(&Config::default(), "key".to_string());

    assert_eq!(
      client.filter_formula(Classification::Mobile),
      r#"FIND("Mobile", ARRAYJOIN({Type}, ",")) > 0"#
    );
    assert_eq!(
      client.filter_formula(Classification::Desktop),
      r#"FIND("Desktop", ARRAYJOIN({Type}, ",")) > 0"#
    );

    let profile = client.filter_formula(Classification::Profile);
    assert!(profile.starts_with("OR("));
    for synonym in ["\"PP\"", "\"Profile\"", "\"Profile Picture\""] {
      assert!(profile.contains(synonym), "missing {synonym} in {profile}");
    }
  }
}
