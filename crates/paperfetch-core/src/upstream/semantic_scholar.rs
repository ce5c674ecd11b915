use std::time::Duration;

use serde::Deserialize;

use super::{
    RawItem, SearchParams, SearchResponse, UpstreamClient, UpstreamError, UpstreamFuture,
    check_response_status,
};

pub const DEFAULT_BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";

/// Fields requested for every paper.
const PAPER_FIELDS: &str =
    "paperId,title,abstract,year,venue,citationCount,authors,url,openAccessPdf";

const USER_AGENT: &str = concat!("paperfetch/", env!("CARGO_PKG_VERSION"));

/// Semantic Scholar Graph API client.
pub struct SemanticScholarClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    data: Vec<RawItem>,
}

impl SemanticScholarClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn search_url(&self, query: &str, params: &SearchParams) -> String {
        let mut url = format!(
            "{}/paper/search?query={}&limit={}&fields={}",
            self.base_url,
            urlencoding::encode(query),
            params.limit,
            PAPER_FIELDS
        );
        if let Some(ref sort) = params.sort {
            url.push_str("&sort=");
            url.push_str(&urlencoding::encode(sort));
        }
        for (name, value) in params.filters.to_query_pairs() {
            url.push('&');
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(&value));
        }
        url
    }

    fn paper_url(&self, paper_id: &str) -> String {
        format!(
            "{}/paper/{}?fields={}",
            self.base_url,
            urlencoding::encode(paper_id),
            PAPER_FIELDS
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, UpstreamError> {
        let mut req = self.client.get(url).timeout(self.timeout);
        if let Some(ref key) = self.api_key {
            req = req.header("x-api-key", key);
        }
        let resp = req.send().await?;
        check_response_status(&resp)?;
        Ok(resp.json().await?)
    }
}

impl UpstreamClient for SemanticScholarClient {
    fn name(&self) -> &str {
        "Semantic Scholar"
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        params: &'a SearchParams,
    ) -> UpstreamFuture<'a, SearchResponse> {
        Box::pin(async move {
            let url = self.search_url(query, params);
            tracing::debug!(query, limit = params.limit, "semantic scholar search");
            let page: SearchPage = self.get_json(&url).await?;
            Ok(SearchResponse {
                count: page.total.map_or(page.data.len(), |t| t as usize),
                results: page.data,
            })
        })
    }

    fn get_by_id<'a>(&'a self, paper_id: &'a str) -> UpstreamFuture<'a, RawItem> {
        Box::pin(async move {
            if paper_id.trim().is_empty() {
                return Err(UpstreamError::validation("paperId", "empty paper id"));
            }
            let url = self.paper_url(paper_id);
            tracing::debug!(paper_id, "semantic scholar paper lookup");
            self.get_json(&url).await
        })
    }
}
