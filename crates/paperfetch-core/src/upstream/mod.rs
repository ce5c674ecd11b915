//! Upstream bibliographic search provider: client trait, raw item shapes,
//! and the error taxonomy shared by the retry policy.

pub mod mock;
pub mod semantic_scholar;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::SearchFilters;
use crate::retry::{Classify, ErrorClass};
use crate::{Author, Paper};

pub type UpstreamFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, UpstreamError>> + Send + 'a>>;

/// Failure talking to the upstream provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => UpstreamError::RateLimited { retry_after },
            408 => UpstreamError::Timeout,
            500..=599 => UpstreamError::Unavailable { status },
            400..=499 => UpstreamError::validation("request", format!("HTTP {status}")),
            _ => UpstreamError::Other(format!("unexpected HTTP {status}")),
        }
    }
}

impl Classify for UpstreamError {
    fn class(&self) -> ErrorClass {
        match self {
            UpstreamError::Validation { .. } => ErrorClass::Validation,
            UpstreamError::RateLimited { .. } => ErrorClass::RateLimited,
            UpstreamError::Timeout
            | UpstreamError::Unavailable { .. }
            | UpstreamError::Connection(_) => ErrorClass::Retryable,
            UpstreamError::Other(_) => ErrorClass::Unclassified,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if let Some(status) = e.status() {
            UpstreamError::from_status(status.as_u16(), None)
        } else if e.is_decode() {
            UpstreamError::Other(format!("malformed response: {e}"))
        } else {
            UpstreamError::Connection(e.to_string())
        }
    }
}

/// Parameters for a search call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub limit: usize,
    /// Provider sort expression, e.g. `citationCount:desc`.
    pub sort: Option<String>,
    pub filters: SearchFilters,
}

/// Normalized search response: total hit count plus the returned items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub count: usize,
    pub results: Vec<RawItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAuthor {
    pub author_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAccessPdf {
    pub url: Option<String>,
}

/// One result item as the provider returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    pub paper_id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub citation_count: Option<u64>,
    #[serde(default)]
    pub authors: Vec<RawAuthor>,
    pub url: Option<String>,
    pub open_access_pdf: Option<OpenAccessPdf>,
}

impl RawItem {
    /// A stub carries an id but no title; it must be fetched by id before use.
    pub fn is_stub(&self) -> bool {
        self.title.as_deref().is_none_or(|t| t.trim().is_empty())
    }

    /// The paper id, if present and non-blank.
    pub fn id(&self) -> Option<&str> {
        self.paper_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Convert into a [`Paper`] stamped with `now`.
    pub fn into_paper(self, now: DateTime<Utc>) -> Result<Paper, UpstreamError> {
        let paper_id = self
            .id()
            .map(String::from)
            .ok_or_else(|| UpstreamError::validation("paperId", "missing paper id"))?;
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                UpstreamError::validation("title", format!("paper {paper_id} has no title"))
            })?;

        let authors = self
            .authors
            .into_iter()
            .filter_map(|a| {
                let name = a.name?.trim().to_string();
                (!name.is_empty()).then_some(Author {
                    author_id: a.author_id,
                    name,
                })
            })
            .collect();

        Ok(Paper {
            paper_id,
            title,
            abstract_text: self.abstract_text.filter(|a| !a.trim().is_empty()),
            year: self.year,
            venue: self.venue.filter(|v| !v.trim().is_empty()),
            citation_count: self.citation_count,
            authors,
            url: self.url,
            pdf_url: self.open_access_pdf.and_then(|p| p.url),
            created_at: now,
            updated_at: now,
        })
    }
}

/// A bibliographic search provider.
pub trait UpstreamClient: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    fn search<'a>(
        &'a self,
        query: &'a str,
        params: &'a SearchParams,
    ) -> UpstreamFuture<'a, SearchResponse>;

    fn get_by_id<'a>(&'a self, paper_id: &'a str) -> UpstreamFuture<'a, RawItem>;
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form: use a conservative fixed wait instead of parsing the date
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// Turn a non-success response into an [`UpstreamError`].
pub fn check_response_status(resp: &reqwest::Response) -> Result<(), UpstreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    Err(UpstreamError::from_status(status.as_u16(), retry_after))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    // ── parse_retry_after ──────────────────────────────────────────────

    #[test]
    fn parse_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn parse_http_date() {
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(val), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_garbage_none() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    // ── check_response_status ──────────────────────────────────────────

    fn response(status: u16, retry_after: Option<&str>) -> reqwest::Response {
        let mut builder = http::Response::builder().status(status);
        if let Some(v) = retry_after {
            builder = builder.header("retry-after", v);
        }
        reqwest::Response::from(builder.body("").unwrap())
    }

    #[test]
    fn ok_on_200() {
        assert!(check_response_status(&response(200, None)).is_ok());
    }

    #[test]
    fn status_429_with_retry_after() {
        let err = check_response_status(&response(429, Some("10"))).unwrap_err();
        assert_eq!(
            err,
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(10))
            }
        );
        assert_eq!(err.class(), ErrorClass::RateLimited);
    }

    #[test]
    fn status_classes() {
        let class = |s| check_response_status(&response(s, None)).unwrap_err().class();
        assert_eq!(class(500), ErrorClass::Retryable);
        assert_eq!(class(503), ErrorClass::Retryable);
        assert_eq!(class(408), ErrorClass::Retryable);
        assert_eq!(class(400), ErrorClass::Validation);
        assert_eq!(class(404), ErrorClass::Validation);
        assert_eq!(class(429), ErrorClass::RateLimited);
    }

    #[test]
    fn other_is_unclassified() {
        assert_eq!(
            UpstreamError::Other("odd".into()).class(),
            ErrorClass::Unclassified
        );
        assert_eq!(
            UpstreamError::Connection("reset".into()).class(),
            ErrorClass::Retryable
        );
    }

    // ── RawItem ────────────────────────────────────────────────────────

    #[test]
    fn deserializes_provider_json() {
        let json = serde_json::json!({
            "paperId": "abc123",
            "title": "Attention Is All You Need",
            "abstract": "We propose the Transformer.",
            "year": 2017,
            "venue": "NeurIPS",
            "citationCount": 100000,
            "authors": [{"authorId": "1", "name": "Ashish Vaswani"}, {"authorId": null, "name": "Noam Shazeer"}],
            "url": "https://www.semanticscholar.org/paper/abc123",
            "openAccessPdf": {"url": "https://arxiv.org/pdf/1706.03762"}
        });
        let raw: RawItem = serde_json::from_value(json).unwrap();
        assert!(!raw.is_stub());
        let paper = raw.into_paper(now()).unwrap();
        assert_eq!(paper.paper_id, "abc123");
        assert_eq!(paper.authors.len(), 2);
        assert_eq!(paper.authors[0].author_id.as_deref(), Some("1"));
        assert_eq!(paper.pdf_url.as_deref(), Some("https://arxiv.org/pdf/1706.03762"));
        assert_eq!(paper.citation_count, Some(100000));
        assert_eq!(paper.created_at, now());
    }

    #[test]
    fn missing_fields_default() {
        let raw: RawItem = serde_json::from_str(r#"{"paperId": "x", "title": "T"}"#).unwrap();
        let paper = raw.into_paper(now()).unwrap();
        assert!(paper.authors.is_empty());
        assert!(paper.abstract_text.is_none());
        assert!(paper.pdf_url.is_none());
    }

    #[test]
    fn missing_id_is_validation_error() {
        let raw = RawItem {
            title: Some("Orphan".into()),
            ..Default::default()
        };
        let err = raw.into_paper(now()).unwrap_err();
        assert!(matches!(err, UpstreamError::Validation { ref field, .. } if field == "paperId"));
    }

    #[test]
    fn untitled_item_is_stub() {
        let raw = RawItem {
            paper_id: Some("p".into()),
            title: Some("   ".into()),
            ..Default::default()
        };
        assert!(raw.is_stub());
        assert!(raw.into_paper(now()).is_err());
    }

    #[test]
    fn nameless_authors_dropped() {
        let raw = RawItem {
            paper_id: Some("p".into()),
            title: Some("T".into()),
            authors: vec![
                RawAuthor {
                    author_id: Some("1".into()),
                    name: None,
                },
                RawAuthor {
                    author_id: None,
                    name: Some("Ada Lovelace".into()),
                },
            ],
            ..Default::default()
        };
        let paper = raw.into_paper(now()).unwrap();
        assert_eq!(paper.authors.len(), 1);
        assert_eq!(paper.authors[0].name, "Ada Lovelace");
    }
}
