// src/dispatch.rs
//! Dispatch: the intake consumer journals insight notices into the pending
//! table, and the batcher turns that table into weekly per-owner digests.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Timelike, Utc};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};
use metrics::counter;
use tokio::sync::mpsc;

use crate::audit::{AuditEntry, AuditLog};
use crate::queue::DispatchNotice;
use crate::retry::RetryPolicy;
use crate::store::{PendingRow, Store};

#[async_trait]
pub trait DigestSender: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}

pub struct SmtpDigestSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpDigestSender {
    pub fn new(host: &str, user: &str, pass: &str, from: &str) -> Result<Self> {
        let creds = Credentials::new(user.to_string(), pass.to_string());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .context("invalid SMTP host")?
            .credentials(creds)
            .build();
        let from = from.parse().context("invalid digest From address")?;
        Ok(Self { mailer, from })
    }
}

#[async_trait]
impl DigestSender for SmtpDigestSender {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let to: Mailbox = address.parse().context("invalid contact address")?;
        let msg = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("build digest email")?;
        self.mailer.send(msg).await.context("send digest email")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

pub struct WebhookDigestSender {
    client: reqwest::Client,
}

impl WebhookDigestSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookDigestSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigestSender for WebhookDigestSender {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let payload = serde_json::json!({ "text": format!("*{subject}*\n{body}") });
        self.client
            .post(address)
            .json(&payload)
            .send()
            .await
            .context("webhook post")?
            .error_for_status()
            .context("webhook non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Routes by the shape of the stored contact address: webhook URLs go over
/// HTTP, anything with an `@` goes over SMTP (when SMTP is configured).
pub struct RoutingSender {
    smtp: Option<SmtpDigestSender>,
    webhook: WebhookDigestSender,
}

impl RoutingSender {
    pub fn new(smtp: Option<SmtpDigestSender>) -> Self {
        Self {
            smtp,
            webhook: WebhookDigestSender::new(),
        }
    }
}

#[async_trait]
impl DigestSender for RoutingSender {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        if address.starts_with("http://") || address.starts_with("https://") {
            return self.webhook.send(address, subject, body).await;
        }
        if address.contains('@') {
            return match &self.smtp {
                Some(smtp) => smtp.send(address, subject, body).await,
                None => Err(anyhow::anyhow!("SMTP not configured")),
            };
        }
        Err(anyhow::anyhow!("unroutable contact address"))
    }

    fn name(&self) -> &'static str {
        "routing"
    }
}

/// Consumer that journals notices into the pending table. The table, not the
/// channel, is the source of truth for the next digest.
pub struct DispatchIntake {
    store: Store,
}

impl DispatchIntake {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<DispatchNotice>) {
        tracing::info!(target: "dispatch", "dispatch intake started");
        while let Some(notice) = rx.recv().await {
            if let Err(e) = self
                .store
                .append_pending(
                    &notice.owner,
                    notice.subscription_id,
                    notice.insight_id,
                    notice.score,
                )
                .await
            {
                tracing::error!(target: "dispatch", error = %e, insight_id = notice.insight_id,
                    "failed to journal pending notice");
            }
        }
        tracing::info!(target: "dispatch", "dispatch intake stopped");
    }
}

pub struct DigestBatcher {
    store: Store,
    audit: AuditLog,
    sender: Arc<dyn DigestSender>,
    retry: RetryPolicy,
    weekday: chrono::Weekday,
    hour: u32,
    top_n: usize,
    tick: std::time::Duration,
}

impl DigestBatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        audit: AuditLog,
        sender: Arc<dyn DigestSender>,
        retry: RetryPolicy,
        weekday: chrono::Weekday,
        hour: u32,
        top_n: usize,
        tick: std::time::Duration,
    ) -> Self {
        Self {
            store,
            audit,
            sender,
            retry,
            weekday,
            hour,
            top_n,
            tick,
        }
    }

    /// Coarse timer loop. The window check fires at most once per calendar
    /// day, so a tick shorter than the window never double-sends.
    pub async fn run(self) {
        tracing::info!(target: "dispatch", sender = self.sender.name(), "digest batcher started");
        let mut last_fired: Option<chrono::NaiveDate> = None;
        loop {
            tokio::time::sleep(self.tick).await;
            let now = Utc::now();
            let in_window = now.weekday() == self.weekday && now.hour() == self.hour;
            if !in_window || last_fired == Some(now.date_naive()) {
                continue;
            }
            last_fired = Some(now.date_naive());
            match self.run_digest_cycle().await {
                Ok(sent) => {
                    tracing::info!(target: "dispatch", digests = sent, "digest cycle complete")
                }
                Err(e) => tracing::error!(target: "dispatch", error = %e, "digest cycle failed"),
            }
        }
    }

    /// Deliver one digest per (owner, subscription) group, then clear ALL
    /// pending rows. Per-group failures forfeit that group's lines rather
    /// than carrying stale rows into next week.
    pub async fn run_digest_cycle(&self) -> Result<usize> {
        let pending = self.store.list_pending().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut groups: HashMap<(String, i64), Vec<PendingRow>> = HashMap::new();
        for row in pending {
            groups
                .entry((row.owner.clone(), row.subscription_id))
                .or_default()
                .push(row);
        }

        let mut delivered = 0usize;
        for ((owner, subscription_id), mut rows) in groups {
            rows.sort_by(|a, b| b.score.total_cmp(&a.score));
            rows.truncate(self.top_n);

            let Some(address) = self.store.get_contact(&owner).await? else {
                tracing::warn!(target: "dispatch", owner = %owner, "no contact on file, skipping digest");
                self.audit
                    .record(
                        AuditEntry::new("dispatcher", "digest.skipped")
                            .owner(&owner)
                            .outcome("no_contact"),
                    )
                    .await;
                continue;
            };

            let mut body = String::new();
            let mut count = 0usize;
            for row in &rows {
                if let Some(ins) = self.store.get_insight(row.insight_id).await? {
                    body.push_str(&format!(
                        "[{:+.2}] ({}) {}\n",
                        ins.score, ins.insight_type, ins.summary
                    ));
                    if !ins.recommended_action.is_empty() {
                        body.push_str(&format!("    action: {}\n", ins.recommended_action));
                    }
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }
            let subject = format!("Weekly digest: {count} insights for subscription {subscription_id}");

            let sent: Result<(), String> = self
                .retry
                .run(|_| {
                    let (address, subject, body) = (address.clone(), subject.clone(), body.clone());
                    async move {
                        self.sender
                            .send(&address, &subject, &body)
                            .await
                            .map_err(|e| format!("{e:#}"))
                    }
                })
                .await;

            match sent {
                Ok(()) => {
                    delivered += 1;
                    counter!("digests_sent_total").increment(1);
                    self.store
                        .record_digest(&owner, subscription_id, count)
                        .await?;
                    self.audit
                        .record(
                            AuditEntry::new("dispatcher", "digest.sent")
                                .owner(&owner)
                                .outcome("ok")
                                .details(serde_json::json!({
                                    "subscription_id": subscription_id,
                                    "insight_count": count,
                                })),
                        )
                        .await;
                }
                Err(e) => {
                    counter!("digest_failures_total").increment(1);
                    tracing::error!(target: "dispatch", owner = %owner, error = %e, "digest delivery failed");
                    self.audit
                        .record(
                            AuditEntry::new("dispatcher", "digest.failed")
                                .owner(&owner)
                                .outcome("delivery_error")
                                .details(serde_json::json!({ "error": e })),
                        )
                        .await;
                }
            }
        }

        // Intentional: the whole table clears even when a group failed, so a
        // permanently broken contact cannot grow the backlog without bound.
        self.store.clear_pending().await?;
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::store::NewInsight;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Captures digests; optionally fails the first N sends.
    struct RecordingSender {
        sent: Mutex<Vec<(String, String, String)>>,
        fail_first: Mutex<u32>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_first: Mutex::new(0),
            })
        }

        fn failing_first(n: u32) -> Arc<Self> {
            let s = Self::new();
            *s.fail_first.lock().unwrap() = n;
            s
        }

        fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DigestSender for RecordingSender {
        async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
            let mut fails = self.fail_first.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(anyhow::anyhow!("transient delivery fault"));
            }
            self.sent.lock().unwrap().push((
                address.to_string(),
                subject.to_string(),
                body.to_string(),
            ));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    async fn seed_insight(store: &Store, owner: &str, sub: i64, score: f64, summary: &str) -> i64 {
        let id = store
            .insert_insight(NewInsight {
                insight_type: "trend".into(),
                score,
                summary: summary.into(),
                evidence_json: "[]".into(),
                recommended_action: String::new(),
                raw_response: None,
                subscription_id: sub,
                owner: owner.into(),
            })
            .await
            .unwrap();
        store.append_pending(owner, sub, id, score).await.unwrap();
        id
    }

    fn batcher(store: Store, sender: Arc<dyn DigestSender>, top_n: usize) -> DigestBatcher {
        DigestBatcher::new(
            store.clone(),
            AuditLog::new(store),
            sender,
            RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1))),
            chrono::Weekday::Mon,
            8,
            top_n,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn digest_orders_by_score_and_caps_at_top_n() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_contact("u1", "u1@example.com").await.unwrap();
        seed_insight(&store, "u1", 1, 0.3, "minor movement").await;
        seed_insight(&store, "u1", 1, 0.9, "major breakthrough").await;
        seed_insight(&store, "u1", 1, 0.5, "moderate shift").await;

        let sender = RecordingSender::new();
        let delivered = batcher(store.clone(), sender.clone(), 2)
            .run_digest_cycle()
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        let body = &sent[0].2;
        let hi = body.find("major breakthrough").unwrap();
        let mid = body.find("moderate shift").unwrap();
        assert!(hi < mid);
        assert!(!body.contains("minor movement")); // beyond top_n
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn groups_split_by_owner_and_subscription() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_contact("u1", "u1@example.com").await.unwrap();
        store.upsert_contact("u2", "https://hooks.example.com/T/B").await.unwrap();
        seed_insight(&store, "u1", 1, 0.4, "one").await;
        seed_insight(&store, "u1", 2, 0.5, "two").await;
        seed_insight(&store, "u2", 3, 0.6, "three").await;

        let sender = RecordingSender::new();
        let delivered = batcher(store.clone(), sender.clone(), 5)
            .run_digest_cycle()
            .await
            .unwrap();

        assert_eq!(delivered, 3);
        assert_eq!(sender.sent().len(), 3);
        assert_eq!(store.count_digests().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_contact_skips_group_but_still_clears() {
        let store = Store::open_in_memory().await.unwrap();
        seed_insight(&store, "ghost", 1, 0.8, "nobody listens").await;

        let sender = RecordingSender::new();
        let delivered = batcher(store.clone(), sender.clone(), 5)
            .run_digest_cycle()
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert!(sender.sent().is_empty());
        assert!(store.list_pending().await.unwrap().is_empty());
        let actions = store.list_audit_actions(10).await.unwrap();
        assert!(actions.iter().any(|(_, a)| a == "digest.skipped"));
    }

    #[tokio::test]
    async fn transient_delivery_fault_is_retried() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_contact("u1", "u1@example.com").await.unwrap();
        seed_insight(&store, "u1", 1, 0.7, "eventually delivered").await;

        let sender = RecordingSender::failing_first(2);
        let delivered = batcher(store.clone(), sender.clone(), 5)
            .run_digest_cycle()
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn empty_pending_is_a_quiet_noop() {
        let store = Store::open_in_memory().await.unwrap();
        let sender = RecordingSender::new();
        let delivered = batcher(store, sender.clone(), 5).run_digest_cycle().await.unwrap();
        assert_eq!(delivered, 0);
        assert!(sender.sent().is_empty());
    }
}
