use std::collections::{HashSet, VecDeque};

use fundwatch_core::{Item, RunCap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AdapterContext, AdapterError, PageCursor, PageFetcher, SourceAdapter};

/// Page ceiling used when a source never returns an empty page.
pub const DEFAULT_MAX_PAGES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A page came back with zero candidates, or only with ids already
    /// yielded in this run by a source that dedups within a run.
    Exhausted,
    /// The run cap was reached before the source ran dry.
    CapReached,
    /// The page ceiling was reached before the source ran dry.
    PageLimit,
    /// A fetch or parse error ended the stream.
    Failed,
}

/// Single-pass, pull-based sequence of items from one source.
///
/// Page N+1 is requested only once every buffered item of page N has been
/// pulled. Iterating again means building a new stream, which re-fetches.
pub struct ItemStream<'a> {
    adapter: &'a dyn SourceAdapter,
    fetcher: &'a dyn PageFetcher,
    ctx: AdapterContext,
    cap: RunCap,
    max_pages: usize,
    cursor: PageCursor,
    buffer: VecDeque<Item>,
    yielded_ids: HashSet<String>,
    examined: usize,
    pages_fetched: usize,
    stop: Option<StopReason>,
}

impl<'a> ItemStream<'a> {
    pub fn new(
        adapter: &'a dyn SourceAdapter,
        fetcher: &'a dyn PageFetcher,
        ctx: AdapterContext,
        cap: RunCap,
    ) -> Self {
        Self {
            adapter,
            fetcher,
            ctx,
            cap,
            max_pages: DEFAULT_MAX_PAGES,
            cursor: PageCursor::default(),
            buffer: VecDeque::new(),
            yielded_ids: HashSet::new(),
            examined: 0,
            pages_fetched: 0,
            stop: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Items handed out so far.
    pub fn examined(&self) -> usize {
        self.examined
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// `None` while the stream can still produce items.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    pub async fn next(&mut self) -> Result<Option<Item>, AdapterError> {
        loop {
            if self.stop.is_some() {
                return Ok(None);
            }
            if self.cap.is_reached(self.examined) {
                self.stop = Some(StopReason::CapReached);
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                self.examined += 1;
                return Ok(Some(item));
            }
            if self.pages_fetched >= self.max_pages {
                debug!(
                    source_id = self.adapter.source_id(),
                    pages = self.pages_fetched,
                    "page ceiling reached"
                );
                self.stop = Some(StopReason::PageLimit);
                return Ok(None);
            }

            match self.fetch_next_page().await {
                Ok(()) => {}
                Err(err) => {
                    self.stop = Some(StopReason::Failed);
                    return Err(err);
                }
            }
        }
    }

    /// Drains the stream into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<Item>, AdapterError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    async fn fetch_next_page(&mut self) -> Result<(), AdapterError> {
        let source_id = self.adapter.source_id();
        let request = self.adapter.listing_request(&self.cursor);
        let page = self
            .fetcher
            .fetch_page(&self.ctx, source_id, &request)
            .await?;
        let candidates = self.adapter.parse_listing(&page)?;

        self.pages_fetched += 1;
        self.cursor.page_index += 1;
        self.cursor.offset += candidates.len();
        debug!(
            source_id,
            page = self.pages_fetched,
            candidates = candidates.len(),
            "parsed listing page"
        );

        if candidates.is_empty() {
            self.stop = Some(StopReason::Exhausted);
            return Ok(());
        }

        if self.adapter.dedups_within_run() {
            for item in candidates {
                if self.yielded_ids.insert(item.id.clone()) {
                    self.buffer.push_back(item);
                } else {
                    debug!(source_id, id = %item.id, "dropping item repeated within run");
                }
            }
            if self.buffer.is_empty() {
                debug!(
                    source_id,
                    page = self.pages_fetched,
                    "page repeated earlier items only, treating listing as exhausted"
                );
                self.stop = Some(StopReason::Exhausted);
            }
        } else {
            self.buffer.extend(candidates);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Crawlability, FetchedPage, ListingRequest};
    use async_trait::async_trait;
    use chrono::Utc;
    use fundwatch_storage::FetchError;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Parses a page body of comma-separated ids.
    struct NumberedSource {
        dedup: bool,
    }

    impl SourceAdapter for NumberedSource {
        fn source_id(&self) -> &'static str {
            "numbered"
        }
        fn state_key(&self) -> &'static str {
            "numbered"
        }
        fn display_name(&self) -> &'static str {
            "Numbered"
        }
        fn crawlability(&self) -> Crawlability {
            Crawlability::Api
        }
        fn listing_request(&self, cursor: &PageCursor) -> ListingRequest {
            ListingRequest::new("mem://numbered")
                .param("page", cursor.page_index)
                .param("offset", cursor.offset)
        }
        fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Item>, AdapterError> {
            let text = page.text();
            if text == "boom" {
                return Err(AdapterError::parse("numbered", "bad page"));
            }
            Ok(text
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|id| Item::new(id, format!("item {id}"), format!("mem://{id}")))
                .collect())
        }
        fn dedups_within_run(&self) -> bool {
            self.dedup
        }
    }

    /// Serves `pages[page]` (empty past the end), or the page number itself when `endless`.
    #[derive(Default)]
    struct RecordingFetcher {
        pages: Vec<String>,
        endless: bool,
        requests: Mutex<Vec<ListingRequest>>,
    }

    impl RecordingFetcher {
        fn serving(pages: &[&str]) -> Self {
            Self {
                pages: pages.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }
        }

        fn requested_pages(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.query[0].1.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PageFetcher for RecordingFetcher {
        async fn fetch_page(
            &self,
            _ctx: &AdapterContext,
            _source_id: &str,
            request: &ListingRequest,
        ) -> Result<FetchedPage, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            let page: usize = request.query[0].1.parse().unwrap();
            let body = if self.endless {
                format!("{page}")
            } else {
                self.pages.get(page).cloned().unwrap_or_default()
            };
            Ok(FetchedPage {
                url: request.url.clone(),
                content_type: "text/plain".into(),
                body: body.into_bytes(),
                fetched_at: Utc::now(),
            })
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(Uuid::new_v4())
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[tokio::test]
    async fn stops_at_first_empty_page_without_requesting_more() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher::serving(&["1,2", "3", "", "4"]);
        let mut stream = ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED);
        let mut items = Vec::new();
        while let Some(item) = stream.next().await.unwrap() {
            items.push(item);
        }
        assert_eq!(ids(&items), vec!["1", "2", "3"]);
        assert_eq!(stream.stop_reason(), Some(StopReason::Exhausted));
        assert_eq!(fetcher.requested_pages(), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn cap_limits_examined_items_and_avoids_extra_fetches() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher::serving(&["1,2,3", "4,5,6", "7,8,9"]);
        let mut stream = ItemStream::new(&source, &fetcher, ctx(), RunCap::from_raw(4));
        let mut items = Vec::new();
        while let Some(item) = stream.next().await.unwrap() {
            items.push(item);
        }
        assert_eq!(ids(&items), vec!["1", "2", "3", "4"]);
        assert_eq!(stream.examined(), 4);
        assert_eq!(stream.stop_reason(), Some(StopReason::CapReached));
        assert_eq!(fetcher.requested_pages(), vec!["0", "1"]);
    }

    #[tokio::test]
    async fn cap_of_twenty_against_large_source_pulls_exactly_twenty() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher {
            endless: true,
            ..Default::default()
        };
        let items = ItemStream::new(&source, &fetcher, ctx(), RunCap::from_raw(20))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(items.len(), 20);
    }

    #[tokio::test]
    async fn offset_counts_candidates_from_previous_pages() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher::serving(&["1,2,3", "4,5", ""]);
        ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED)
            .collect_all()
            .await
            .unwrap();
        let offsets = fetcher
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.query[1].1.clone())
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec!["0", "3", "5"]);
    }

    #[tokio::test]
    async fn unbounded_cap_still_terminates_at_page_ceiling() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher {
            endless: true,
            ..Default::default()
        };
        let mut stream =
            ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED).with_max_pages(5);
        let mut count = 0;
        while stream.next().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(stream.pages_fetched(), 5);
        assert_eq!(stream.stop_reason(), Some(StopReason::PageLimit));
    }

    #[tokio::test]
    async fn within_run_dedup_drops_repeated_ids_but_keeps_paging() {
        let source = NumberedSource { dedup: true };
        let fetcher = RecordingFetcher::serving(&["1,2", "2,3", "4", ""]);
        let items = ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(ids(&items), vec!["1", "2", "3", "4"]);
        assert_eq!(fetcher.requested_pages(), vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn page_of_only_repeated_ids_ends_a_deduping_stream() {
        let source = NumberedSource { dedup: true };
        // Out-of-range pages keep echoing the last real page.
        let fetcher = RecordingFetcher::serving(&["1,2", "3", "3", "3", "3"]);
        let mut stream = ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED);
        let mut items = Vec::new();
        while let Some(item) = stream.next().await.unwrap() {
            items.push(item);
        }
        assert_eq!(ids(&items), vec!["1", "2", "3"]);
        assert_eq!(stream.stop_reason(), Some(StopReason::Exhausted));
        assert_eq!(fetcher.requested_pages(), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn repeats_pass_through_without_within_run_dedup() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher::serving(&["1,2", "2", ""]);
        let items = ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(ids(&items), vec!["1", "2", "2"]);
    }

    #[tokio::test]
    async fn parse_error_ends_stream_as_failed() {
        let source = NumberedSource { dedup: false };
        let fetcher = RecordingFetcher::serving(&["1", "boom", "2"]);
        let mut stream = ItemStream::new(&source, &fetcher, ctx(), RunCap::UNBOUNDED);
        assert_eq!(stream.next().await.unwrap().map(|i| i.id), Some("1".to_string()));
        assert!(matches!(stream.next().await, Err(AdapterError::Parse { .. })));
        assert_eq!(stream.stop_reason(), Some(StopReason::Failed));
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(fetcher.requested_pages(), vec!["0", "1"]);
    }
}
