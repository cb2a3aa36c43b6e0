use fundwatch_core::Item;
use serde_json::Value as JsonValue;

use crate::{
    json_field, json_string, AdapterError, Crawlability, FetchedPage, ListingRequest, PageCursor,
    SourceAdapter,
};

const SOURCE_ID: &str = "tanker-fund";
const LISTING_URL: &str = "https://api.tanker.fund/product/list/";
const PAGE_SIZE: usize = 9;

/// Product status codes understood by the listing API.
pub mod status {
    pub const RESERVE: &[u8] = &[1];
    pub const OPEN: &[u8] = &[2, 3];
    pub const CLOSE: &[u8] = &[4, 5, 6, 7, 8];
}

/// Paginated JSON product listing, filtered to open products.
#[derive(Debug, Clone)]
pub struct TankerFundAdapter {
    listing_url: String,
    page_size: usize,
    statuses: &'static [u8],
}

impl Default for TankerFundAdapter {
    fn default() -> Self {
        Self {
            listing_url: LISTING_URL.to_string(),
            page_size: PAGE_SIZE,
            statuses: status::OPEN,
        }
    }
}

impl TankerFundAdapter {
    /// Status codes sent as repeated `filter_status` parameters; see [`status`].
    pub fn with_statuses(mut self, statuses: &'static [u8]) -> Self {
        self.statuses = statuses;
        self
    }
}

impl SourceAdapter for TankerFundAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn state_key(&self) -> &'static str {
        "tankerfundchannel"
    }

    fn display_name(&self) -> &'static str {
        "탱커펀드"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    fn listing_request(&self, cursor: &PageCursor) -> ListingRequest {
        let mut request = ListingRequest::new(&self.listing_url)
            .param("count", self.page_size)
            .param("offset", cursor.offset);
        for code in self.statuses {
            request = request.param("filter_status", code);
        }
        request
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Item>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(&page.body).map_err(|e| {
            AdapterError::parse(SOURCE_ID, format!("invalid JSON from {}: {e}", page.url))
        })?;
        if !value.is_object() {
            return Err(AdapterError::parse(
                SOURCE_ID,
                format!("expected a JSON object from {}", page.url),
            ));
        }

        let products = match value.get("products") {
            None | Some(JsonValue::Null) => return Ok(Vec::new()),
            Some(JsonValue::Array(products)) => products,
            Some(other) => {
                return Err(AdapterError::parse(
                    SOURCE_ID,
                    format!("`products` is not an array: {other}"),
                ))
            }
        };

        products.iter().map(product_to_item).collect()
    }
}

fn product_to_item(product: &JsonValue) -> Result<Item, AdapterError> {
    let id = json_string(SOURCE_ID, product, "id")?;
    let title = json_string(SOURCE_ID, product, "title")?;
    // Some products ship without a summary; the notification body is then empty.
    let description = match json_field(SOURCE_ID, product, "short_description")? {
        JsonValue::Null => String::new(),
        _ => json_string(SOURCE_ID, product, "short_description")?,
    };
    Ok(Item {
        id,
        title,
        description,
    })
}
