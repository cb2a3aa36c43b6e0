use fundwatch_core::Item;
use scraper::Html;

use crate::{
    element_text, selector, AdapterError, Crawlability, FetchedPage, ListingRequest, PageCursor,
    SourceAdapter,
};

const SOURCE_ID: &str = "tera-funding";
const SITE_URL: &str = "https://www.terafunding.com";
const LISTING_PATH: &str = "/Invest";

const ITEMS_SELECTOR: &str = r#"div#contents_wraper ul[class="row grid-block-v2"] > li"#;
const LINK_SELECTOR: &str = "div.caption_goods > h3.mgoods2-tit a";

/// HTML investment listing paged by `page_no`, starting at 1.
#[derive(Debug, Clone)]
pub struct TeraFundingAdapter {
    site_url: String,
}

impl Default for TeraFundingAdapter {
    fn default() -> Self {
        Self {
            site_url: SITE_URL.to_string(),
        }
    }
}

impl TeraFundingAdapter {
    pub fn with_site_url(mut self, url: impl Into<String>) -> Self {
        self.site_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn detail_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!("{}{}", self.site_url, href)
        }
    }
}

impl SourceAdapter for TeraFundingAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn state_key(&self) -> &'static str {
        "terafundchannel"
    }

    fn display_name(&self) -> &'static str {
        "테라펀드"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    fn listing_request(&self, cursor: &PageCursor) -> ListingRequest {
        ListingRequest::new(format!("{}{}", self.site_url, LISTING_PATH))
            .param("page_no", cursor.page_index + 1)
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Item>, AdapterError> {
        let document = Html::parse_document(&page.text());
        let items_sel = selector(SOURCE_ID, ITEMS_SELECTOR)?;
        let link_sel = selector(SOURCE_ID, LINK_SELECTOR)?;

        let mut items = Vec::new();
        for (position, product) in document.select(&items_sel).enumerate() {
            let link = product.select(&link_sel).next().ok_or_else(|| {
                AdapterError::parse(
                    SOURCE_ID,
                    format!("listing entry {position} on {} has no title link", page.url),
                )
            })?;
            let href = link.value().attr("href").map(str::trim).ok_or_else(|| {
                AdapterError::parse(
                    SOURCE_ID,
                    format!("title link of entry {position} on {} has no href", page.url),
                )
            })?;
            let id = href
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .ok_or_else(|| {
                    AdapterError::parse(SOURCE_ID, format!("cannot derive id from href {href:?}"))
                })?;

            items.push(Item {
                id: id.to_string(),
                title: element_text(link).unwrap_or_default(),
                description: self.detail_url(href),
            });
        }
        Ok(items)
    }

    // The listing repeats featured products on every page.
    fn dedups_within_run(&self) -> bool {
        true
    }
}
