//! Source adapter contracts, the paginated item stream, and the built-in adapters.

mod stream;
mod tanker_fund;
mod tera_funding;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundwatch_core::Item;
use fundwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use stream::{ItemStream, StopReason, DEFAULT_MAX_PAGES};
pub use tanker_fund::TankerFundAdapter;
pub use tera_funding::TeraFundingAdapter;

pub const CRATE_NAME: &str = "fundwatch-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crawlability {
    PublicHtml,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

/// Position of the next listing page to request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    /// Zero-based page number.
    pub page_index: usize,
    /// Candidates returned by all previous pages.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl ListingRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_id}: {message}")]
    Parse {
        source_id: &'static str,
        message: String,
    },
}

impl AdapterError {
    pub fn parse(source_id: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_id,
            message: message.into(),
        }
    }
}

/// Network seam between the item stream and the remote listing.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        source_id: &str,
        request: &ListingRequest,
    ) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        source_id: &str,
        request: &ListingRequest,
    ) -> Result<FetchedPage, FetchError> {
        let resp = self
            .fetch_bytes(ctx.run_id, source_id, &request.url, &request.query)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: resp.content_type,
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }
}

/// Fetch + parse + normalize rules for one listing site.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Names the persisted seen-set file.
    fn state_key(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn crawlability(&self) -> Crawlability;

    fn listing_request(&self, cursor: &PageCursor) -> ListingRequest;

    /// An empty result means the listing is exhausted.
    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Item>, AdapterError>;

    /// Whether the site repeats items across pages within one run.
    fn dedups_within_run(&self) -> bool {
        false
    }
}

pub fn builtin_adapters() -> Vec<Arc<dyn SourceAdapter>> {
    vec![
        Arc::new(TankerFundAdapter::default()),
        Arc::new(TeraFundingAdapter::default()),
    ]
}

pub fn adapter_for_source(source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
    builtin_adapters()
        .into_iter()
        .find(|adapter| adapter.source_id() == source_id)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(source_id: &'static str, css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::parse(source_id, format!("selector {css}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn json_field<'a>(
    source_id: &'static str,
    value: &'a JsonValue,
    field: &str,
) -> Result<&'a JsonValue, AdapterError> {
    value
        .get(field)
        .ok_or_else(|| AdapterError::parse(source_id, format!("missing field `{field}`")))
}

fn json_string(
    source_id: &'static str,
    value: &JsonValue,
    field: &str,
) -> Result<String, AdapterError> {
    match json_field(source_id, value, field)? {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(AdapterError::parse(
            source_id,
            format!("field `{field}` is not a string or number: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_resolves_builtin_sources() {
        let ids = builtin_adapters()
            .iter()
            .map(|a| a.source_id())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["tanker-fund", "tera-funding"]);
        assert!(adapter_for_source("tera-funding").is_some());
        assert!(adapter_for_source("nope").is_none());
    }

    #[test]
    fn state_keys_match_legacy_file_names() {
        let keys = builtin_adapters()
            .iter()
            .map(|a| a.state_key())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["tankerfundchannel", "terafundchannel"]);
        for key in keys {
            assert_eq!(fundwatch_core::sanitize_state_key(key), key);
        }
    }

    #[test]
    fn listing_request_keeps_repeated_params_in_order() {
        let req = ListingRequest::new("https://example.test/list")
            .param("status", 2)
            .param("status", 3);
        assert_eq!(
            req.query,
            vec![
                ("status".to_string(), "2".to_string()),
                ("status".to_string(), "3".to_string())
            ]
        );
    }

    #[test]
    fn json_string_accepts_numbers_and_rejects_missing_fields() {
        let value = json!({"id": 42, "title": "x", "flag": true});
        assert_eq!(json_string("t", &value, "id").unwrap(), "42");
        assert_eq!(json_string("t", &value, "title").unwrap(), "x");
        assert!(matches!(
            json_string("t", &value, "missing"),
            Err(AdapterError::Parse { .. })
        ));
        assert!(json_string("t", &value, "flag").is_err());
    }
}
