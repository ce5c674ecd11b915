//! Cache key derivation.
//!
//! A search is identified by its normalized query text, the requested limit,
//! and its canonical filter set. The three are joined into one canonical
//! string and hashed with SHA-256, so keys are fixed-length and opaque.
//! An empty filter set hashes exactly like an unfiltered search.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a derived key in hex characters.
pub const KEY_LEN: usize = 64;

/// Separator between canonical key components (ASCII unit separator).
const SEP: char = '\u{1f}';

/// Provider-side filters that narrow a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Year or year range in provider syntax: `2019`, `2016-2020`, `2010-`, `-2015`.
    pub year: Option<String>,
    pub venues: Vec<String>,
    pub fields_of_study: Vec<String>,
    pub publication_types: Vec<String>,
    pub open_access_only: bool,
    pub min_citation_count: Option<u32>,
}

impl SearchFilters {
    /// Whether this filter set leaves results unrestricted.
    pub fn is_empty(&self) -> bool {
        self.canonical().is_none()
    }

    /// Order-independent canonical form, `None` when no filter is active.
    pub fn canonical(&self) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(year) = self.year.as_deref().map(str::trim)
            && !year.is_empty()
        {
            parts.push(format!("year={year}"));
        }
        for (name, values) in [
            ("venue", &self.venues),
            ("fields", &self.fields_of_study),
            ("types", &self.publication_types),
        ] {
            let list = canonical_list(values);
            if !list.is_empty() {
                parts.push(format!("{name}={}", list.join(",")));
            }
        }
        if self.open_access_only {
            parts.push("oa=1".to_string());
        }
        if let Some(n) = self.min_citation_count.filter(|n| *n > 0) {
            parts.push(format!("mincites={n}"));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(";"))
        }
    }

    /// Query-string pairs understood by the provider's search endpoint.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(year) = self.year.as_deref().map(str::trim)
            && !year.is_empty()
        {
            pairs.push(("year", year.to_string()));
        }
        for (name, values) in [
            ("venue", &self.venues),
            ("fieldsOfStudy", &self.fields_of_study),
            ("publicationTypes", &self.publication_types),
        ] {
            let joined: Vec<&str> = values
                .iter()
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .collect();
            if !joined.is_empty() {
                pairs.push((name, joined.join(",")));
            }
        }
        if self.open_access_only {
            pairs.push(("openAccessPdf", String::new()));
        }
        if let Some(n) = self.min_citation_count.filter(|n| *n > 0) {
            pairs.push(("minCitationCount", n.to_string()));
        }
        pairs
    }
}

fn canonical_list(values: &[String]) -> Vec<String> {
    let mut list: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    list.sort();
    list.dedup();
    list
}

/// Collapse whitespace and lowercase, so cosmetic variants share a key.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Derive the opaque cache key for a search.
pub fn derive_key(query: &str, limit: usize, filters: Option<&SearchFilters>) -> String {
    let mut canonical = format!("q={}{SEP}limit={limit}", normalize_query(query));
    if let Some(f) = filters.and_then(SearchFilters::canonical) {
        canonical.push(SEP);
        canonical.push_str("filters=");
        canonical.push_str(&f);
    }
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Ephemeral-tier slot name for a search entry.
pub fn search_slot(key: &str) -> String {
    format!("search:{key}")
}

/// Ephemeral-tier slot name for a single paper.
pub fn paper_slot(paper_id: &str) -> String {
    format!("paper:{paper_id}")
}
