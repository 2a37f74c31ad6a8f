// src/ingest/feed.rs
//! RSS fetching and parsing. The fetcher sends conditional headers from the
//! previous cycle so an unchanged feed costs one 304 and no parse.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> i64 {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct FeedEntry {
    /// Stable per-feed identifier: guid, else link, else title.
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    /// Unix seconds from pubDate; 0 when missing or unparseable.
    pub published_at: i64,
}

/// Validators carried between poll cycles for conditional requests.
#[derive(Debug, Clone, Default)]
pub struct FetchState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

pub enum FetchOutcome {
    /// Server confirmed the cached representation is current.
    NotModified,
    Fetched {
        entries: Vec<FeedEntry>,
        state: FetchState,
    },
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, state: &FetchState) -> Result<FetchOutcome>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str, state: &FetchState) -> Result<FetchOutcome> {
        let mut req = self.client.get(url);
        if let Some(etag) = &state.etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = &state.last_modified {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, lm);
        }

        let resp = req.send().await.context("feed http get")?;
        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            counter!("feed_not_modified_total").increment(1);
            return Ok(FetchOutcome::NotModified);
        }
        let resp = resp.error_for_status().context("feed non-2xx")?;

        let header_str = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let next = FetchState {
            etag: header_str(reqwest::header::ETAG),
            last_modified: header_str(reqwest::header::LAST_MODIFIED),
        };

        let body = resp.text().await.context("feed body")?;
        let entries = parse_feed(&body)?;
        Ok(FetchOutcome::Fetched {
            entries,
            state: next,
        })
    }
}

pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let cleaned = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&cleaned).context("parsing rss xml")?;

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let title = it.title.as_deref().unwrap_or_default().trim().to_string();
        let url = it.link.as_deref().unwrap_or_default().trim().to_string();
        let body = normalize_text(it.description.as_deref().unwrap_or_default());
        if title.is_empty() && body.is_empty() {
            continue;
        }
        let source_id = it
            .guid
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| if url.is_empty() { title.clone() } else { url.clone() });
        out.push(FeedEntry {
            source_id,
            title,
            body,
            url,
            published_at: it.pub_date.as_deref().map(parse_rfc2822_to_unix).unwrap_or(0),
        });
    }
    // Oldest first so registration order follows publication order.
    out.sort_by_key(|e| e.published_at);
    counter!("feed_entries_parsed_total").increment(out.len() as u64);
    Ok(out)
}

/// Strip markup and collapse whitespace so downstream prompts and
/// fingerprints see plain text.
pub fn normalize_text(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw);
    let mut out = String::with_capacity(decoded.len());
    let mut in_tag = false;
    for ch in decoded.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

// Feeds routinely embed HTML entities the XML parser rejects.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
