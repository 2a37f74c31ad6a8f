// src/moderate.rs
//! Moderation gate: a queue consumer that classifies content via an external
//! judgment call and fails closed on any uncertainty. Every decision is
//! persisted, allowed or not.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::auth::{CredentialValidator, Expectations};
use crate::error::{AuthError, AuthResult};
use crate::judge::JudgmentClient;
use crate::queue::{ModerationDecision, ModerationJob, ModerationRequest};
use crate::retry::RetryPolicy;
use crate::store::{ModerationRecord, Store};

pub const MODERATION_SCOPE: &str = "moderation:classify";

/// Hash indexed by the moderation log for audit lookup.
pub fn content_hash(title: &str, body: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(body.as_bytes());
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_moderation_prompt(title: &str, body: &str) -> String {
    let title: String = title.chars().take(1_000).collect();
    let body: String = body.chars().take(5_000).collect();
    format!(
        "You are a strict content moderation agent. Analyze the text and determine whether it is allowed.\n\
         Return ONLY a valid JSON object with keys:\n\
         - allowed: boolean\n\
         - categories: array of strings (possible values: \"sexual\",\"violent\",\"criminal\",\"hate\",\"other\")\n\
         - reason: short string\n\n\
         TITLE: {}\nCONTENT: {}\n\
         Rules:\n1) Output only JSON.\n2) If unsure, block conservatively.\n",
        serde_json::json!(title),
        serde_json::json!(body),
    )
}

#[derive(serde::Deserialize)]
struct RawDecision {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    reason: String,
}

/// Cloneable submission side of the gate. `moderate` is the credential-gated
/// entry point pipeline callers use; the token is verified before any work is
/// queued. Synchronous from the caller's perspective via the reply channel.
#[derive(Clone)]
pub struct ModerationHandle {
    tx: mpsc::UnboundedSender<ModerationJob>,
    validator: Arc<CredentialValidator>,
    audience: String,
}

impl ModerationHandle {
    pub fn new(
        tx: mpsc::UnboundedSender<ModerationJob>,
        validator: Arc<CredentialValidator>,
        audience: String,
    ) -> Self {
        Self {
            tx,
            validator,
            audience,
        }
    }

    /// Verify the presented delegated credential, then classify. Reusable
    /// credentials (cached per subscription) are expected here, so the jti
    /// is not consumed.
    pub async fn moderate(
        &self,
        token: &str,
        request: ModerationRequest,
    ) -> AuthResult<ModerationDecision> {
        self.validator
            .verify(
                token,
                &Expectations {
                    audience: Some(&self.audience),
                    required_scopes: &[MODERATION_SCOPE],
                    ..Default::default()
                },
            )
            .await?;
        self.submit(request).await
    }

    /// Enqueue without credential checks. Callers must have verified the
    /// presenting credential themselves (the HTTP layer does).
    pub async fn submit(&self, request: ModerationRequest) -> AuthResult<ModerationDecision> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ModerationJob {
                request,
                reply: reply_tx,
            })
            .map_err(|_| AuthError::UpstreamUnavailable("moderation gate offline".into()))?;
        reply_rx
            .await
            .map_err(|_| AuthError::UpstreamUnavailable("moderation gate dropped request".into()))
    }
}

pub struct ModerationGate {
    store: Store,
    judge: Arc<dyn JudgmentClient>,
    retry: RetryPolicy,
    call_timeout: Duration,
    /// Floor, not cap: applied after every item regardless of outcome to
    /// respect external rate limits.
    floor_delay: Duration,
}

impl ModerationGate {
    pub fn new(
        store: Store,
        judge: Arc<dyn JudgmentClient>,
        retry: RetryPolicy,
        call_timeout: Duration,
        floor_delay: Duration,
    ) -> Self {
        Self {
            store,
            judge,
            retry,
            call_timeout,
            floor_delay,
        }
    }

    /// Consumer loop. Ends when the submission side is dropped at shutdown.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ModerationJob>) {
        tracing::info!(target: "moderate", provider = self.judge.name(), "moderation gate started");
        while let Some(job) = rx.recv().await {
            let decision = self.classify_and_log(&job.request).await;
            // Submitter may have gone away; the log row above is still durable.
            let _ = job.reply.send(decision);
            tokio::time::sleep(self.floor_delay).await;
        }
        tracing::info!(target: "moderate", "moderation gate stopped");
    }

    /// Classify one item and persist the ModerationRecord regardless of
    /// outcome. Never errors: uncertainty degrades to `allowed = false`.
    pub async fn classify_and_log(&self, req: &ModerationRequest) -> ModerationDecision {
        let prompt = build_moderation_prompt(&req.title, &req.body);

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

        let (decision, raw) = match outcome {
            Ok(raw) => match serde_json::from_str::<RawDecision>(&raw) {
                Ok(parsed) => (
                    ModerationDecision {
                        allowed: parsed.allowed,
                        categories: parsed.categories,
                        reason: parsed.reason,
                    },
                    raw,
                ),
                // Fail closed on output we cannot interpret.
                Err(_) => (
                    ModerationDecision {
                        allowed: false,
                        categories: vec!["other".to_string()],
                        reason: "unparseable model output".to_string(),
                    },
                    raw,
                ),
            },
            Err(last_err) => (
                ModerationDecision {
                    allowed: false,
                    categories: vec!["other".to_string()],
                    reason: last_err,
                },
                String::new(),
            ),
        };

        counter!("moderation_decisions_total").increment(1);
        if !decision.allowed {
            counter!("moderation_blocked_total").increment(1);
        }

        let snippet: String = req.body.chars().take(2_000).collect();
        let record = ModerationRecord {
            subscription_id: req.subscription_id,
            item_title: req.title.clone(),
            item_url: req.url.clone(),
            content_hash: content_hash(&req.title, &req.body, &req.url),
            content_snippet: snippet,
            allowed: decision.allowed,
            categories: decision.categories.clone(),
            reason: decision.reason.clone(),
            model_response: raw,
        };
        if let Err(e) = self.store.insert_moderation(record).await {
            tracing::error!(target: "moderate", error = %e, "failed to persist moderation record");
        }

        tracing::info!(
            target: "moderate",
            allowed = decision.allowed,
            reason = %decision.reason,
            "moderation decision"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::ScriptedJudgment;
    use crate::retry::Backoff;
    use anyhow::Result;
    use async_trait::async_trait;

    fn request() -> ModerationRequest {
        ModerationRequest {
            subscription_id: Some(1),
            title: "A paper".into(),
            body: "Benign content".into(),
            url: "https://example.org/x".into(),
        }
    }

    fn gate(store: Store, judge: Arc<dyn JudgmentClient>) -> ModerationGate {
        ModerationGate::new(
            store,
            judge,
            RetryPolicy::new(2, Backoff::Linear(Duration::from_millis(1))),
            Duration::from_millis(50),
            Duration::from_millis(0),
        )
    }

    #[tokio::test]
    async fn explicit_allow_is_forwarded_and_logged() {
        let store = Store::open_in_memory().await.unwrap();
        let judge = Arc::new(ScriptedJudgment::new(vec![Ok(
            r#"{"allowed": true, "categories": [], "reason": "fine"}"#.to_string(),
        )]));
        let decision = gate(store.clone(), judge).classify_and_log(&request()).await;
        assert!(decision.allowed);

        let req = request();
        let hash = content_hash(&req.title, &req.body, &req.url);
        let rows = store.moderation_by_hash(&hash).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].allowed);
        assert!(!rows[0].degraded);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_closed_with_logged_reason() {
        let store = Store::open_in_memory().await.unwrap();
        let judge = Arc::new(ScriptedJudgment::always_failing());
        let decision = gate(store.clone(), judge.clone())
            .classify_and_log(&request())
            .await;
        assert!(!decision.allowed);
        assert_eq!(judge.calls(), 2); // bounded attempt count

        let req = request();
        let hash = content_hash(&req.title, &req.body, &req.url);
        let rows = store.moderation_by_hash(&hash).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].allowed);
        // no model output: recorded as degraded, not a real classification
        assert!(rows[0].degraded);
    }

    struct HangingJudgment;

    #[async_trait]
    impl JudgmentClient for HangingJudgment {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn timeout_on_every_attempt_records_timeout_reason() {
        let store = Store::open_in_memory().await.unwrap();
        let decision = gate(store.clone(), Arc::new(HangingJudgment))
            .classify_and_log(&request())
            .await;
        assert!(!decision.allowed);
        assert!(decision.reason.contains("timeout"), "reason: {}", decision.reason);
    }

    #[tokio::test]
    async fn unparseable_output_blocks_conservatively() {
        let store = Store::open_in_memory().await.unwrap();
        let judge = Arc::new(ScriptedJudgment::new(vec![Ok("not json at all".into())]));
        let decision = gate(store, judge).classify_and_log(&request()).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "unparseable model output");
    }
}
