// src/ingest/mod.rs
//! Polling ingestion. Each subscription gets its own poller task; a cycle
//! fetches the feed conditionally, drops already-seen fingerprints, runs new
//! content through the moderation gate under a delegated credential, and
//! hands approved items to the insight extractor.

pub mod feed;
pub mod normalize;

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::audit::{AuditEntry, AuditLog};
use crate::auth::CredentialIssuer;
use crate::fingerprint::fingerprint;
use crate::moderate::{content_hash, ModerationHandle, MODERATION_SCOPE};
use crate::queue::{InsightJob, ModerationRequest};
use crate::store::{NewItem, Store, SubscriptionRow};
use feed::{FeedFetcher, FetchOutcome, FetchState};

#[derive(Debug, Default, Clone, Copy)]
pub struct PollStats {
    pub fetched: usize,
    pub new_items: usize,
    pub deduped: usize,
    pub blocked: usize,
    pub queued: usize,
}

/// Everything one poll cycle needs. Cloned into each poller task.
#[derive(Clone)]
pub struct PollerContext {
    pub store: Store,
    pub fetcher: Arc<dyn FeedFetcher>,
    pub moderation: ModerationHandle,
    pub issuer: Arc<CredentialIssuer>,
    pub audit: AuditLog,
    pub insight_tx: mpsc::UnboundedSender<InsightJob>,
    pub poll_interval: std::time::Duration,
}

impl PollerContext {
    /// One fetch-dedup-moderate-register pass over a subscription's feed.
    pub async fn poll_cycle(
        &self,
        sub: &SubscriptionRow,
        state: &mut FetchState,
    ) -> anyhow::Result<PollStats> {
        let mut stats = PollStats::default();

        let entries = match self.fetcher.fetch(&sub.endpoint, state).await? {
            FetchOutcome::NotModified => {
                tracing::debug!(target: "ingest", subscription_id = sub.id, "feed not modified");
                return Ok(stats);
            }
            FetchOutcome::Fetched {
                entries,
                state: next,
            } => {
                *state = next;
                entries
            }
        };
        stats.fetched = entries.len();

        for entry in entries {
            let fp = fingerprint(&entry.body, &entry.url);
            if self.store.fingerprint_seen(&sub.source, &fp).await? {
                stats.deduped += 1;
                continue;
            }

            // A fingerprint miss with a prior moderation verdict means the
            // content was classified before and blocked (approved content
            // would have an item row). Reuse the verdict instead of paying
            // for another judgment call. Degraded verdicts (gate failed
            // closed without model output) do not count; the content gets
            // a real classification on its next sighting.
            let hash = content_hash(&entry.title, &entry.body, &entry.url);
            let prior = self.store.moderation_by_hash(&hash).await?;
            let allowed = match prior.iter().rev().find(|v| !v.degraded) {
                Some(verdict) => verdict.allowed,
                None => {
                    // A failed mint skips the item for this cycle only; the
                    // entry is not fingerprinted yet and returns next poll.
                    let cred = match self
                        .issuer
                        .credential_for(
                            &format!("scout-sub-{}", sub.id),
                            "moderator",
                            &[MODERATION_SCOPE.to_string()],
                        )
                        .await
                    {
                        Ok(cred) => cred,
                        Err(e) => {
                            tracing::warn!(
                                target: "ingest",
                                subscription_id = sub.id,
                                error = %e,
                                "credential mint failed, skipping item this cycle"
                            );
                            continue;
                        }
                    };
                    let decision = self
                        .moderation
                        .moderate(
                            &cred.token,
                            ModerationRequest {
                                subscription_id: Some(sub.id),
                                title: entry.title.clone(),
                                body: entry.body.clone(),
                                url: entry.url.clone(),
                            },
                        )
                        .await?;
                    decision.allowed
                }
            };
            if !allowed {
                stats.blocked += 1;
                counter!("items_blocked_total").increment(1);
                continue;
            }

            let item = NewItem {
                subscription_id: sub.id,
                source: sub.source.clone(),
                source_id: entry.source_id,
                title: entry.title,
                body: entry.body,
                url: entry.url,
                fingerprint: fp,
            };
            // None means another poller raced us to the same fingerprint.
            let Some(item_id) = self.store.insert_item(item).await? else {
                stats.deduped += 1;
                continue;
            };
            stats.new_items += 1;
            counter!("items_ingested_total").increment(1);

            if self
                .insight_tx
                .send(InsightJob {
                    item_id,
                    subscription_id: sub.id,
                })
                .is_ok()
            {
                stats.queued += 1;
            }
        }

        self.audit
            .record(
                AuditEntry::new("scout", "items.fetched")
                    .owner(&sub.owner)
                    .details(serde_json::json!({
                        "subscription_id": sub.id,
                        "fetched": stats.fetched,
                        "new": stats.new_items,
                        "blocked": stats.blocked,
                    })),
            )
            .await;
        Ok(stats)
    }
}

/// Tracks one poller task per active subscription.
pub struct PollerRegistry {
    ctx: PollerContext,
    tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl PollerRegistry {
    pub fn new(ctx: PollerContext) -> Self {
        Self {
            ctx,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a poller for `sub`. Idempotent per subscription id. The first
    /// cycle runs immediately, then on the configured interval.
    pub async fn start(&self, sub: SubscriptionRow) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&sub.id) {
            return;
        }
        let ctx = self.ctx.clone();
        let id = sub.id;
        let handle = tokio::spawn(async move {
            let mut state = FetchState::default();
            let mut ticker = tokio::time::interval(ctx.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                counter!("poll_cycles_total").increment(1);
                match ctx.poll_cycle(&sub, &mut state).await {
                    Ok(stats) => tracing::info!(
                        target: "ingest",
                        subscription_id = sub.id,
                        fetched = stats.fetched,
                        new = stats.new_items,
                        deduped = stats.deduped,
                        blocked = stats.blocked,
                        "poll cycle"
                    ),
                    Err(e) => tracing::warn!(
                        target: "ingest",
                        subscription_id = sub.id,
                        error = %e,
                        "poll cycle failed"
                    ),
                }
            }
        });
        tasks.insert(id, handle);
        gauge!("active_pollers").set(tasks.len() as f64);
    }

    /// Abort the poller for `id` and wait for the task to finish. Returns
    /// false when none was running.
    pub async fn stop(&self, id: i64) -> bool {
        let handle = {
            let mut tasks = self.tasks.lock().await;
            let handle = tasks.remove(&id);
            gauge!("active_pollers").set(tasks.len() as f64);
            handle
        };
        match handle {
            Some(handle) => {
                handle.abort();
                let _ = handle.await;
                true
            }
            None => false,
        }
    }

    /// Restart pollers for every stored subscription. Called once at boot so
    /// subscriptions survive a process restart.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let subs = self.ctx.store.list_subscriptions(None).await?;
        let n = subs.len();
        for sub in subs {
            self.start(sub).await;
        }
        tracing::info!(target: "ingest", restored = n, "pollers restored from store");
        Ok(n)
    }

    pub async fn active(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Abort every poller and wait for each task to finish. Called once on
    /// process shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            let handles = tasks.drain().map(|(_, h)| h).collect();
            gauge!("active_pollers").set(0.0);
            handles
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}
