// src/insight.rs
//! Insight extraction: consumes approved items, asks the judgment model for a
//! structured insight and persists exactly one row per item. Total judgment
//! failure degrades to a neutral insight instead of losing the item.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;

use crate::audit::{AuditEntry, AuditLog};
use crate::judge::JudgmentClient;
use crate::queue::{DispatchNotice, InsightJob};
use crate::retry::RetryPolicy;
use crate::store::{ItemRow, NewInsight, Store};

fn build_insight_prompt(title: &str, body: &str) -> String {
    let title: String = title.chars().take(1_000).collect();
    let body: String = body.chars().take(8_000).collect();
    format!(
        "You are an analyst. Extract one structured insight from the content below.\n\
         Return ONLY a valid JSON object with keys:\n\
         - type: one of \"trend\",\"risk\",\"opportunity\",\"other\"\n\
         - score: number between 0.0 and 1.0 (significance)\n\
         - summary: one or two sentences\n\
         - evidence: array of short verbatim quotes\n\
         - recommended_action: short string, may be empty\n\n\
         TITLE: {}\nCONTENT: {}\n",
        serde_json::json!(title),
        serde_json::json!(body),
    )
}

#[derive(serde::Deserialize)]
struct RawInsight {
    #[serde(rename = "type", default)]
    insight_type: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    evidence: serde_json::Value,
    #[serde(default)]
    recommended_action: String,
}

const INSIGHT_TYPES: &[&str] = &["trend", "risk", "opportunity", "other"];

/// Scores are significance in `[0.0, 1.0]`; anything outside is clamped,
/// then rounded to 3 decimals.
fn clamp_score(score: f64) -> f64 {
    let clamped = score.clamp(0.0, 1.0);
    (clamped * 1_000.0).round() / 1_000.0
}

pub struct InsightExtractor {
    store: Store,
    judge: Arc<dyn JudgmentClient>,
    audit: AuditLog,
    retry: RetryPolicy,
    call_timeout: Duration,
    call_delay: Duration,
    dispatch_tx: mpsc::UnboundedSender<DispatchNotice>,
}

impl InsightExtractor {
    pub fn new(
        store: Store,
        judge: Arc<dyn JudgmentClient>,
        audit: AuditLog,
        retry: RetryPolicy,
        call_timeout: Duration,
        call_delay: Duration,
        dispatch_tx: mpsc::UnboundedSender<DispatchNotice>,
    ) -> Self {
        Self {
            store,
            judge,
            audit,
            retry,
            call_timeout,
            call_delay,
            dispatch_tx,
        }
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<InsightJob>) {
        tracing::info!(target: "insight", provider = self.judge.name(), "insight extractor started");
        while let Some(job) = rx.recv().await {
            if let Err(e) = self.process(&job).await {
                tracing::error!(target: "insight", item_id = job.item_id, error = %e, "insight job failed");
            }
            tokio::time::sleep(self.call_delay).await;
        }
        tracing::info!(target: "insight", "insight extractor stopped");
    }

    /// Handle one approved item end to end. Returns Err only on storage
    /// faults; judgment failure is absorbed into the neutral fallback.
    pub async fn process(&self, job: &InsightJob) -> anyhow::Result<()> {
        let Some(item) = self.store.load_item(job.item_id).await? else {
            tracing::warn!(target: "insight", item_id = job.item_id, "item vanished before analysis");
            return Ok(());
        };

        // The subscription may be deleted while the job sits in the queue.
        // Without it there is no owner to attribute the insight to, so the
        // job is abandoned rather than guessed at.
        let Some(sub) = self.store.get_subscription(item.subscription_id).await? else {
            tracing::warn!(
                target: "insight",
                item_id = job.item_id,
                subscription_id = item.subscription_id,
                "subscription deleted mid-flight, abandoning item"
            );
            self.audit
                .record(
                    AuditEntry::new("analyst", "insight.abandoned")
                        .outcome("subscription_missing")
                        .details(serde_json::json!({ "item_id": item.id })),
                )
                .await;
            return Ok(());
        };

        let (insight, raw) = self.extract(&item).await;
        let insight_id = self
            .store
            .insert_insight(NewInsight {
                insight_type: insight.insight_type.clone(),
                score: insight.score,
                summary: insight.summary.clone(),
                evidence_json: insight.evidence.to_string(),
                recommended_action: insight.recommended_action.clone(),
                raw_response: raw,
                subscription_id: sub.id,
                owner: sub.owner.clone(),
            })
            .await?;
        counter!("insights_extracted_total").increment(1);

        self.audit
            .record(
                AuditEntry::new("analyst", "insight.extracted")
                    .owner(&sub.owner)
                    .outcome("ok")
                    .details(serde_json::json!({
                        "item_id": item.id,
                        "insight_id": insight_id,
                        "type": insight.insight_type,
                        "score": insight.score,
                    })),
            )
            .await;

        // Best effort: a full pending table is rebuilt from this notice, but
        // a dropped notice only costs one digest line, never the insight row.
        let _ = self.dispatch_tx.send(DispatchNotice {
            insight_id,
            subscription_id: sub.id,
            owner: sub.owner,
            score: insight.score,
            summary: insight.summary,
        });
        Ok(())
    }

    /// Call the judgment model with retries; on total failure return the
    /// neutral insight so the item still yields exactly one row.
    async fn extract(&self, item: &ItemRow) -> (RawInsight, Option<String>) {
        let prompt = build_insight_prompt(&item.title, &item.body);
        let outcome: Result<String, String> = self
            .retry
            .run(|attempt| {
                let prompt = prompt.clone();
                async move {
                    match tokio::time::timeout(self.call_timeout, self.judge.complete(&prompt))
                        .await
                    {
                        Ok(Ok(text)) => Ok(text),
                        Ok(Err(e)) => Err(format!("judgment error: {e:#}")),
                        Err(_) => Err(format!("timeout_attempt_{attempt}")),
                    }
                }
            })
            .await;

        match outcome {
            Ok(raw) => match serde_json::from_str::<RawInsight>(&raw) {
                Ok(mut parsed) => {
                    if !INSIGHT_TYPES.contains(&parsed.insight_type.as_str()) {
                        parsed.insight_type = "other".to_string();
                    }
                    parsed.score = clamp_score(parsed.score);
                    if !parsed.evidence.is_array() {
                        parsed.evidence = serde_json::json!([]);
                    }
                    (parsed, Some(raw))
                }
                Err(_) => (neutral_insight("unparseable model output"), Some(raw)),
            },
            Err(last_err) => {
                counter!("insight_fallback_total").increment(1);
                (neutral_insight(&last_err), None)
            }
        }
    }
}

fn neutral_insight(reason: &str) -> RawInsight {
    RawInsight {
        insight_type: "other".to_string(),
        score: 0.0,
        summary: format!("analysis unavailable: {reason}"),
        evidence: serde_json::json!([]),
        recommended_action: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::ScriptedJudgment;
    use crate::retry::Backoff;
    use crate::store::NewItem;

    async fn seed(store: &Store) -> InsightJob {
        let sub_id = store
            .insert_subscription("u1", "arxiv", "https://export.arxiv.org/rss/cs.CL")
            .await
            .unwrap();
        let item_id = store
            .insert_item(NewItem {
                subscription_id: sub_id,
                source: "arxiv".into(),
                source_id: "2401.00001".into(),
                title: "A paper".into(),
                body: "Findings suggest a clear upward trend".into(),
                url: "https://arxiv.org/abs/2401.00001".into(),
                fingerprint: "fp".into(),
            })
            .await
            .unwrap()
            .unwrap();
        InsightJob {
            item_id,
            subscription_id: sub_id,
        }
    }

    fn extractor(
        store: Store,
        judge: Arc<dyn JudgmentClient>,
        tx: mpsc::UnboundedSender<DispatchNotice>,
    ) -> InsightExtractor {
        InsightExtractor::new(
            store.clone(),
            judge,
            AuditLog::new(store),
            RetryPolicy::new(3, Backoff::Exponential(Duration::from_millis(1))),
            Duration::from_millis(50),
            Duration::from_millis(0),
            tx,
        )
    }

    #[tokio::test]
    async fn structured_insight_is_persisted_and_forwarded() {
        let store = Store::open_in_memory().await.unwrap();
        let job = seed(&store).await;
        let judge = Arc::new(ScriptedJudgment::new(vec![Ok(r#"{
            "type": "trend", "score": 0.8123456, "summary": "Clear upward trend",
            "evidence": ["clear upward trend"], "recommended_action": "watch"
        }"#
        .to_string())]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        extractor(store.clone(), judge, tx).process(&job).await.unwrap();

        let rows = store.list_insights(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].insight_type, "trend");
        assert_eq!(rows[0].score, 0.812); // rounded to 3 decimals
        assert_eq!(rows[0].owner, "u1");

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.insight_id, rows[0].id);
        assert_eq!(notice.owner, "u1");
    }

    #[tokio::test]
    async fn total_failure_yields_exactly_one_neutral_insight() {
        let store = Store::open_in_memory().await.unwrap();
        let job = seed(&store).await;
        let judge = Arc::new(ScriptedJudgment::always_failing());
        let (tx, mut rx) = mpsc::unbounded_channel();

        extractor(store.clone(), judge.clone(), tx)
            .process(&job)
            .await
            .unwrap();

        assert_eq!(judge.calls(), 3); // bounded attempts
        let rows = store.list_insights(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].insight_type, "other");
        assert_eq!(rows[0].score, 0.0);
        assert!(rows[0].summary.starts_with("analysis unavailable"));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn deleted_subscription_abandons_the_item() {
        let store = Store::open_in_memory().await.unwrap();
        let job = seed(&store).await;
        store.delete_subscription(job.subscription_id).await.unwrap();
        let judge = Arc::new(ScriptedJudgment::new(vec![Ok("{}".into())]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        extractor(store.clone(), judge.clone(), tx)
            .process(&job)
            .await
            .unwrap();

        assert_eq!(judge.calls(), 0);
        assert!(store.list_insights(10).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
        let actions = store.list_audit_actions(10).await.unwrap();
        assert!(actions.iter().any(|(_, a)| a == "insight.abandoned"));
    }

    #[tokio::test]
    async fn out_of_range_fields_are_normalised() {
        let store = Store::open_in_memory().await.unwrap();
        let job = seed(&store).await;
        let judge = Arc::new(ScriptedJudgment::new(vec![Ok(r#"{
            "type": "galaxy-brain", "score": 7.5, "summary": "s",
            "evidence": "not-a-list", "recommended_action": ""
        }"#
        .to_string())]));
        let (tx, _rx) = mpsc::unbounded_channel();

        extractor(store.clone(), judge, tx).process(&job).await.unwrap();

        let rows = store.list_insights(10).await.unwrap();
        assert_eq!(rows[0].insight_type, "other");
        assert_eq!(rows[0].score, 1.0);
        assert_eq!(rows[0].evidence_json, "[]");
    }

    #[tokio::test]
    async fn negative_scores_clamp_to_zero() {
        let store = Store::open_in_memory().await.unwrap();
        let job = seed(&store).await;
        let judge = Arc::new(ScriptedJudgment::new(vec![Ok(r#"{
            "type": "risk", "score": -0.5, "summary": "s",
            "evidence": [], "recommended_action": ""
        }"#
        .to_string())]));
        let (tx, _rx) = mpsc::unbounded_channel();

        extractor(store.clone(), judge, tx).process(&job).await.unwrap();

        let rows = store.list_insights(10).await.unwrap();
        assert_eq!(rows[0].score, 0.0);
        assert!((0.0..=1.0).contains(&rows[0].score));
    }
}
