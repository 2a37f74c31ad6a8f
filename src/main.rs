//! Veritas pipeline binary entrypoint.
//! Boots the store, the credential layer, the pipeline consumers and the
//! Axum HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use veritas_pipeline::api::{create_router, AppState, Audiences};
use veritas_pipeline::audit::AuditLog;
use veritas_pipeline::auth::{
    CredentialIssuer, CredentialValidator, HttpJwksFetcher, HttpTokenBroker, InProcessReplayStore,
    JwksCache, JwksFetch, LocalSigner, ReplayStore, ServiceEntitlements, SqliteReplayStore,
    TokenBroker,
};
use veritas_pipeline::config::AppConfig;
use veritas_pipeline::dispatch::{DigestBatcher, DispatchIntake, RoutingSender, SmtpDigestSender};
use veritas_pipeline::ingest::feed::HttpFeedFetcher;
use veritas_pipeline::ingest::{PollerContext, PollerRegistry};
use veritas_pipeline::insight::InsightExtractor;
use veritas_pipeline::judge::ChatCompletionClient;
use veritas_pipeline::metrics::Metrics;
use veritas_pipeline::moderate::{ModerationGate, ModerationHandle};
use veritas_pipeline::queue::Queues;
use veritas_pipeline::retry::{Backoff, RetryPolicy};
use veritas_pipeline::store::Store;

/// Serves a fixed JWKS document. Used in local-signing mode where the
/// validator must trust the in-process signer.
struct StaticJwks(serde_json::Value);

#[async_trait]
impl JwksFetch for StaticJwks {
    async fn fetch(&self) -> Result<jsonwebtoken::jwk::JwkSet> {
        serde_json::from_value(self.0.clone()).context("static jwks parse")
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env();
    let metrics = Metrics::init()?;

    let store = Store::open(&cfg.db_path)
        .await
        .with_context(|| format!("opening store at {}", cfg.db_path))?;
    let audit = AuditLog::new(store.clone());

    // Prefer shared replay suppression; degrade to process-local (with its
    // weaker guarantee) only if the shared store cannot serve the window.
    let probe = format!("boot-probe-{}", uuid::Uuid::new_v4());
    let replay: Arc<dyn ReplayStore> = match store
        .replay_check_and_set(&probe, std::time::Duration::from_secs(1))
        .await
    {
        Ok(_) => Arc::new(SqliteReplayStore::new(store.clone())),
        Err(e) => {
            tracing::warn!(error = %e, "shared replay store unavailable, falling back to process-local suppression");
            Arc::new(InProcessReplayStore::new())
        }
    };

    // Local-signing mode keeps the whole trust loop in-process; otherwise the
    // validator trusts the identity provider's published keys.
    let (broker, jwks): (Box<dyn TokenBroker>, JwksCache) = match &cfg.local_signing_secret {
        Some(secret) => {
            let signer = LocalSigner::new(
                secret.as_bytes(),
                "local",
                "veritas-service",
                "veritas-concierge",
            );
            let jwks = JwksCache::new(Box::new(StaticJwks(signer.jwk_set_json())), cfg.jwks_cache_ttl);
            tracing::info!("credential issuance in local-signing mode");
            (Box::new(signer), jwks)
        }
        None => {
            let jwks = JwksCache::new(
                Box::new(HttpJwksFetcher::new(cfg.jwks_url.clone())),
                cfg.jwks_cache_ttl,
            );
            (
                Box::new(HttpTokenBroker::new(
                    cfg.exchange_url.clone(),
                    cfg.service_access_key.clone(),
                )),
                jwks,
            )
        }
    };

    let validator = Arc::new(CredentialValidator::new(
        jwks,
        replay,
        cfg.clock_skew,
        cfg.replay_ttl,
    ));
    tracing::info!(mode = ?validator.replay_mode(), "replay suppression active");

    let entitlements = ServiceEntitlements::new(
        cfg.audience_aliases.values().cloned(),
        cfg.entitled_scopes.clone(),
    );
    let issuer = Arc::new(CredentialIssuer::new(
        broker,
        validator.clone(),
        cfg.audience_aliases.clone(),
        entitlements,
        cfg.delegation_ttl,
        cfg.mint_safety_buffer,
    ));

    let judge = Arc::new(ChatCompletionClient::new(
        &cfg.llm_endpoint,
        &cfg.llm_api_key,
        &cfg.llm_model,
        cfg.llm_timeout,
    ));
    let queues = Queues::new();

    let gate = ModerationGate::new(
        store.clone(),
        judge.clone(),
        RetryPolicy::new(2, Backoff::Linear(std::time::Duration::from_secs(1))),
        cfg.llm_timeout,
        cfg.llm_call_delay,
    );
    tokio::spawn(gate.run(queues.moderation_rx));
    let moderation = ModerationHandle::new(
        queues.moderation_tx,
        validator.clone(),
        cfg.aud_moderator.clone(),
    );

    let extractor = InsightExtractor::new(
        store.clone(),
        judge,
        audit.clone(),
        RetryPolicy::new(3, Backoff::Exponential(std::time::Duration::from_secs(1))),
        cfg.llm_timeout,
        cfg.llm_call_delay,
        queues.dispatch_tx.clone(),
    );
    tokio::spawn(extractor.run(queues.insight_rx));

    tokio::spawn(DispatchIntake::new(store.clone()).run(queues.dispatch_rx));

    let smtp = if cfg.smtp_host.is_empty() {
        None
    } else {
        Some(SmtpDigestSender::new(
            &cfg.smtp_host,
            &cfg.smtp_user,
            &cfg.smtp_pass,
            &cfg.digest_from,
        )?)
    };
    let batcher = DigestBatcher::new(
        store.clone(),
        audit.clone(),
        Arc::new(RoutingSender::new(smtp)),
        RetryPolicy::new(3, Backoff::Exponential(std::time::Duration::from_secs(2))),
        cfg.digest_weekday,
        cfg.digest_hour,
        cfg.digest_top_n,
        cfg.batcher_tick,
    );
    tokio::spawn(batcher.run());

    let pollers = Arc::new(PollerRegistry::new(PollerContext {
        store: store.clone(),
        fetcher: Arc::new(HttpFeedFetcher::new(std::time::Duration::from_secs(20))),
        moderation: moderation.clone(),
        issuer: issuer.clone(),
        audit: audit.clone(),
        insight_tx: queues.insight_tx.clone(),
        poll_interval: cfg.poll_interval,
    }));
    pollers.restore().await?;

    let state = AppState {
        store,
        validator,
        issuer,
        moderation,
        pollers,
        audit,
        audiences: Audiences {
            scout: cfg.aud_scout.clone(),
            moderator: cfg.aud_moderator.clone(),
            analyst: cfg
                .audience_aliases
                .get("analyst")
                .cloned()
                .unwrap_or_else(|| "veritas-analyst".to_string()),
            dispatcher: cfg.aud_dispatcher.clone(),
        },
        rsshub_base: cfg.rsshub_base.clone(),
    };
    let pollers = state.pollers.clone();
    let router = create_router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "serving");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    pollers.shutdown().await;
    Ok(())
}
