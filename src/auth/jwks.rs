// src/auth/jwks.rs
//! Signer public-key set, cached with a TTL and a single-flight refresh.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use metrics::counter;
use tokio::sync::Mutex;

/// Source of the signer's JWKS document. Production fetches over HTTP; tests
/// substitute a counting stub.
#[async_trait]
pub trait JwksFetch: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet>;
}

pub struct HttpJwksFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl JwksFetch for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("jwks fetch")?
            .error_for_status()
            .context("jwks non-2xx")?;
        resp.json::<JwkSet>().await.context("jwks parse")
    }
}

struct CachedSet {
    set: JwkSet,
    fetched_at: Instant,
}

/// TTL cache over a [`JwksFetch`]. Refresh is single-flight: the fetch runs
/// under the cache mutex with a double-check, so N concurrent verifications
/// racing an expired cache produce exactly one upstream request and the rest
/// await its result.
pub struct JwksCache {
    fetcher: Box<dyn JwksFetch>,
    ttl: Duration,
    inner: Mutex<Option<CachedSet>>,
}

impl JwksCache {
    pub fn new(fetcher: Box<dyn JwksFetch>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            inner: Mutex::new(None),
        }
    }

    /// Look up the key for `kid`, refreshing the set if the cache is stale.
    pub async fn key_for(&self, kid: &str) -> Result<Option<Jwk>> {
        let mut guard = self.inner.lock().await;
        if let Some(cached) = &*guard {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.set.find(kid).cloned());
            }
        }
        let set = self.fetcher.fetch().await?;
        counter!("jwks_refresh_total").increment(1);
        let found = set.find(kid).cloned();
        *guard = Some(CachedSet {
            set,
            fetched_at: Instant::now(),
        });
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingFetcher {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JwksFetch for CountingFetcher {
        async fn fetch(&self) -> Result<JwkSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Tiny artificial latency widens the race window.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let set: JwkSet = serde_json::from_value(serde_json::json!({
                "keys": [{ "kty": "oct", "kid": "k1", "k": "c2VjcmV0" }]
            }))?;
            Ok(set)
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_refresh() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = Arc::new(JwksCache::new(
            Box::new(CountingFetcher {
                calls: calls.clone(),
            }),
            Duration::from_secs(300),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.key_for("k1").await.unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_ttl_triggers_a_second_fetch() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = JwksCache::new(
            Box::new(CountingFetcher {
                calls: calls.clone(),
            }),
            Duration::from_millis(0),
        );
        cache.key_for("k1").await.unwrap();
        cache.key_for("k1").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_kid_is_none_without_refetch_within_ttl() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = JwksCache::new(
            Box::new(CountingFetcher {
                calls: calls.clone(),
            }),
            Duration::from_secs(300),
        );
        assert!(cache.key_for("nope").await.unwrap().is_none());
        assert!(cache.key_for("nope").await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
