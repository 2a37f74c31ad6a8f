// tests/common/mod.rs
//! Shared harness: an in-process trust loop (local signer + matching JWKS)
//! and a fully wired pipeline over an in-memory store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use tokio::sync::mpsc;

use veritas_pipeline::audit::AuditLog;
use veritas_pipeline::auth::{
    Audience, CredentialIssuer, CredentialValidator, DelegatedClaims, JwksCache, JwksFetch,
    LocalSigner, ServiceEntitlements, SqliteReplayStore,
};
use veritas_pipeline::ingest::feed::{FeedEntry, FeedFetcher, FetchOutcome, FetchState};
use veritas_pipeline::ingest::PollerContext;
use veritas_pipeline::judge::JudgmentClient;
use veritas_pipeline::moderate::{ModerationGate, ModerationHandle};
use veritas_pipeline::queue::InsightJob;
use veritas_pipeline::retry::{Backoff, RetryPolicy};
use veritas_pipeline::store::Store;

pub const SECRET: &[u8] = b"integration-test-secret";
pub const KID: &str = "it-key";

pub struct StaticJwks(pub serde_json::Value);

#[async_trait]
impl JwksFetch for StaticJwks {
    async fn fetch(&self) -> anyhow::Result<jsonwebtoken::jwk::JwkSet> {
        Ok(serde_json::from_value(self.0.clone())?)
    }
}

pub fn signer() -> LocalSigner {
    LocalSigner::new(SECRET, KID, "veritas-service", "veritas-concierge")
}

pub fn aliases() -> HashMap<String, String> {
    [
        ("scout", "veritas-scout"),
        ("moderator", "veritas-moderator"),
        ("analyst", "veritas-analyst"),
        ("dispatcher", "veritas-dispatcher"),
    ]
    .into_iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect()
}

pub fn entitled_scopes() -> Vec<String> {
    [
        "data:read:arxiv",
        "data:read:twitter",
        "moderation:classify",
        "analysis:perform",
        "insights:read",
        "contacts:write",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

pub fn validator(store: &Store) -> Arc<CredentialValidator> {
    let jwks = JwksCache::new(
        Box::new(StaticJwks(signer().jwk_set_json())),
        Duration::from_secs(300),
    );
    Arc::new(CredentialValidator::new(
        jwks,
        Arc::new(SqliteReplayStore::new(store.clone())),
        Duration::from_secs(60),
        Duration::from_secs(300),
    ))
}

pub fn issuer(validator: Arc<CredentialValidator>) -> Arc<CredentialIssuer> {
    let entitlements = ServiceEntitlements::new(aliases().into_values(), entitled_scopes());
    Arc::new(CredentialIssuer::new(
        Box::new(signer()),
        validator,
        aliases(),
        entitlements,
        Duration::from_secs(300),
        Duration::from_secs(30),
    ))
}

/// Sign a credential for `sub` directly, as an end user presenting a token
/// minted by the identity provider would. Fresh jti every call.
pub fn user_token(sub: &str, aud: &str, scope: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = DelegatedClaims {
        sub: Some(sub.to_string()),
        aud: Some(Audience::One(aud.to_string())),
        scope: (!scope.is_empty()).then(|| scope.to_string()),
        iat: Some(now),
        exp: Some(now + 300),
        jti: Some(uuid::Uuid::new_v4().to_string()),
        ..Default::default()
    };
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).expect("sign test token")
}

/// Pops scripted fetch outcomes; answers NotModified once the script runs dry.
pub struct ScriptedFetcher {
    script: tokio::sync::Mutex<VecDeque<Vec<FeedEntry>>>,
}

impl ScriptedFetcher {
    pub fn new(cycles: Vec<Vec<FeedEntry>>) -> Arc<Self> {
        Arc::new(Self {
            script: tokio::sync::Mutex::new(cycles.into_iter().collect()),
        })
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str, _state: &FetchState) -> anyhow::Result<FetchOutcome> {
        match self.script.lock().await.pop_front() {
            Some(entries) => Ok(FetchOutcome::Fetched {
                entries,
                state: FetchState::default(),
            }),
            None => Ok(FetchOutcome::NotModified),
        }
    }
}

pub fn entry(source_id: &str, title: &str, body: &str, url: &str) -> FeedEntry {
    FeedEntry {
        source_id: source_id.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        url: url.to_string(),
        published_at: 0,
    }
}

pub struct TestPipeline {
    pub store: Store,
    pub validator: Arc<CredentialValidator>,
    pub issuer: Arc<CredentialIssuer>,
    pub moderation: ModerationHandle,
    pub ctx: PollerContext,
    pub insight_rx: mpsc::UnboundedReceiver<InsightJob>,
}

/// Wire store, gate and poller context around the given judge and fetcher.
/// The moderation gate runs on a spawned task, as in the real process.
pub async fn pipeline(
    judge: Arc<dyn JudgmentClient>,
    fetcher: Arc<dyn FeedFetcher>,
) -> TestPipeline {
    let store = Store::open_in_memory().await.expect("in-memory store");
    let validator = validator(&store);
    let issuer = issuer(validator.clone());

    let (moderation_tx, moderation_rx) = mpsc::unbounded_channel();
    let (insight_tx, insight_rx) = mpsc::unbounded_channel();

    let gate = ModerationGate::new(
        store.clone(),
        judge,
        RetryPolicy::new(2, Backoff::Linear(Duration::from_millis(1))),
        Duration::from_millis(100),
        Duration::from_millis(0),
    );
    tokio::spawn(gate.run(moderation_rx));
    let moderation = ModerationHandle::new(
        moderation_tx,
        validator.clone(),
        "veritas-moderator".to_string(),
    );

    let ctx = PollerContext {
        store: store.clone(),
        fetcher,
        moderation: moderation.clone(),
        issuer: issuer.clone(),
        audit: AuditLog::new(store.clone()),
        insight_tx,
        poll_interval: Duration::from_secs(3600),
    };

    TestPipeline {
        store,
        validator,
        issuer,
        moderation,
        ctx,
        insight_rx,
    }
}

/// A judge that always allows, for tests that exercise paths past the gate.
pub fn allowing_judge(times: usize) -> Arc<veritas_pipeline::judge::ScriptedJudgment> {
    let ok = r#"{"allowed": true, "categories": [], "reason": "clean"}"#.to_string();
    Arc::new(veritas_pipeline::judge::ScriptedJudgment::new(
        std::iter::repeat_with(|| Ok(ok.clone())).take(times).collect(),
    ))
}

/// A judge that always blocks.
pub fn blocking_judge(times: usize) -> Arc<veritas_pipeline::judge::ScriptedJudgment> {
    let no = r#"{"allowed": false, "categories": ["other"], "reason": "nope"}"#.to_string();
    Arc::new(veritas_pipeline::judge::ScriptedJudgment::new(
        std::iter::repeat_with(|| Ok(no.clone())).take(times).collect(),
    ))
}
