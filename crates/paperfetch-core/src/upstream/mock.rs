//! Scripted upstream client for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    RawItem, SearchParams, SearchResponse, UpstreamClient, UpstreamError, UpstreamFuture,
};

/// A configurable response for [`MockUpstream::search`].
#[derive(Clone, Debug)]
pub enum MockSearch {
    /// Return these items.
    Items(Vec<RawItem>),
    /// Fail with this error.
    Error(UpstreamError),
}

/// A hand-rolled mock implementing [`UpstreamClient`].
///
/// Search supports a fixed response, or a sequence (one per call, the last
/// repeated once exhausted). `get_by_id` answers from a per-id table and
/// reports a validation error for unknown ids. Every call is counted and the
/// params of the latest search are recorded.
pub struct MockUpstream {
    responses: Mutex<Vec<MockSearch>>,
    fallback: MockSearch,
    by_id: Mutex<HashMap<String, Result<RawItem, UpstreamError>>>,
    delay: Option<Duration>,
    search_calls: AtomicUsize,
    get_calls: AtomicUsize,
    last_params: Mutex<Option<SearchParams>>,
}

impl MockUpstream {
    /// Always answer searches with `response`.
    pub fn new(response: MockSearch) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response,
            by_id: Mutex::new(HashMap::new()),
            delay: None,
            search_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    /// Answer searches with `items` every time.
    pub fn with_items(items: Vec<RawItem>) -> Self {
        Self::new(MockSearch::Items(items))
    }

    /// Answer searches in order, repeating the last response.
    pub fn with_sequence(mut responses: Vec<MockSearch>) -> Self {
        assert!(
            !responses.is_empty(),
            "sequence must have at least one response"
        );
        responses.reverse();
        let fallback = responses[0].clone();
        let mock = Self::new(fallback);
        *mock.responses.lock().unwrap() = responses;
        mock
    }

    /// Register the `get_by_id` answer for `paper_id`.
    pub fn with_paper(self, paper_id: &str, response: Result<RawItem, UpstreamError>) -> Self {
        self.by_id
            .lock()
            .unwrap()
            .insert(paper_id.to_string(), response);
        self
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Total upstream calls of either kind.
    pub fn total_calls(&self) -> usize {
        self.search_calls() + self.get_calls()
    }

    pub fn last_params(&self) -> Option<SearchParams> {
        self.last_params.lock().unwrap().clone()
    }

    fn next_search(&self) -> MockSearch {
        let mut seq = self.responses.lock().unwrap();
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

impl UpstreamClient for MockUpstream {
    fn name(&self) -> &str {
        "mock"
    }

    fn search<'a>(
        &'a self,
        _query: &'a str,
        params: &'a SearchParams,
    ) -> UpstreamFuture<'a, SearchResponse> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = Some(params.clone());
        let response = self.next_search();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match response {
                MockSearch::Items(items) => {
                    let results: Vec<RawItem> = items.into_iter().take(params.limit).collect();
                    Ok(SearchResponse {
                        count: results.len(),
                        results,
                    })
                }
                MockSearch::Error(e) => Err(e),
            }
        })
    }

    fn get_by_id<'a>(&'a self, paper_id: &'a str) -> UpstreamFuture<'a, RawItem> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .by_id
            .lock()
            .unwrap()
            .get(paper_id)
            .cloned()
            .unwrap_or_else(|| {
                Err(UpstreamError::validation(
                    "paperId",
                    format!("unknown paper {paper_id}"),
                ))
            });
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            response
        })
    }
}

/// A complete raw item with a deterministic title.
pub fn raw_item(paper_id: &str) -> RawItem {
    RawItem {
        paper_id: Some(paper_id.to_string()),
        title: Some(format!("Paper {paper_id}")),
        year: Some(2020),
        citation_count: Some(1),
        ..Default::default()
    }
}

/// A raw item that carries only an id and must be fetched by id.
pub fn stub_item(paper_id: &str) -> RawItem {
    RawItem {
        paper_id: Some(paper_id.to_string()),
        ..Default::default()
    }
}

/// `n` complete raw items with ids `p0..p{n-1}`.
pub fn raw_items(n: usize) -> Vec<RawItem> {
    (0..n).map(|i| raw_item(&format!("p{i}"))).collect()
}
