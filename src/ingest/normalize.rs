// src/ingest/normalize.rs
//! Source kinds and endpoint normalisation. A subscription names a source and
//! a raw endpoint (a category, a handle or a full URL); normalisation turns
//! that into the concrete feed URL the poller fetches.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Arxiv,
    Twitter,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Arxiv => "arxiv",
            SourceKind::Twitter => "twitter",
        }
    }

    /// The read scope a caller must hold to subscribe to this source.
    pub fn required_scope(&self) -> &'static str {
        match self {
            SourceKind::Arxiv => "data:read:arxiv",
            SourceKind::Twitter => "data:read:twitter",
        }
    }

    /// Resolve a raw endpoint into a feed URL. Full URLs pass through; short
    /// forms expand per source (an arXiv category, a Twitter handle).
    pub fn normalize_endpoint(&self, raw: &str, rsshub_base: &str) -> String {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return raw.to_string();
        }
        match self {
            SourceKind::Arxiv => format!("https://rss.arxiv.org/rss/{raw}"),
            SourceKind::Twitter => {
                let handle = raw.trim_start_matches('@');
                format!("{}/twitter/user/{handle}", rsshub_base.trim_end_matches('/'))
            }
        }
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arxiv" => Ok(SourceKind::Arxiv),
            "twitter" => Ok(SourceKind::Twitter),
            other => Err(anyhow::anyhow!("unsupported source: {other}")),
        }
    }
}
