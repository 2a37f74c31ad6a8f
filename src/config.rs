// src/config.rs
//! Process configuration. Everything comes from the environment (after an
//! optional `.env` load in main) with conservative defaults, so a bare
//! `cargo run` boots against local stores.

use std::collections::HashMap;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: String,

    // Credential layer
    pub jwks_url: String,
    /// Access-key exchange endpoint at the identity provider.
    pub exchange_url: String,
    pub service_access_key: String,
    /// When set, tokens are signed in-process instead of exchanged upstream.
    pub local_signing_secret: Option<String>,
    pub jwks_cache_ttl: Duration,
    pub replay_ttl: Duration,
    pub clock_skew: Duration,
    pub delegation_ttl: Duration,
    pub mint_safety_buffer: Duration,
    /// Friendly alias -> audience identifier table for `delegate`.
    pub audience_aliases: HashMap<String, String>,
    pub aud_scout: String,
    pub aud_moderator: String,
    pub aud_dispatcher: String,
    /// Scopes the backing service credential may grant; requests outside this
    /// set are rejected as escalation.
    pub entitled_scopes: Vec<String>,

    // Ingestion
    pub poll_interval: Duration,
    pub rsshub_base: String,

    // External judgment calls
    pub llm_endpoint: String,
    pub llm_model: String,
    pub llm_api_key: String,
    pub llm_timeout: Duration,
    pub llm_call_delay: Duration,

    // Digest delivery
    pub smtp_host: String,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub digest_from: String,
    pub digest_weekday: chrono::Weekday,
    pub digest_hour: u32,
    pub digest_top_n: usize,
    pub batcher_tick: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let aud_scout = env_or("AUD_SCOUT", "veritas-scout");
        let aud_moderator = env_or("AUD_MODERATOR", "veritas-moderator");
        let aud_analyst = env_or("AUD_ANALYST", "veritas-analyst");
        let aud_dispatcher = env_or("AUD_DISPATCHER", "veritas-dispatcher");

        let mut audience_aliases = HashMap::new();
        audience_aliases.insert("scout".to_string(), aud_scout.clone());
        audience_aliases.insert("moderator".to_string(), aud_moderator.clone());
        audience_aliases.insert("analyst".to_string(), aud_analyst);
        audience_aliases.insert("dispatcher".to_string(), aud_dispatcher.clone());

        let entitled_scopes = env_or(
            "ENTITLED_SCOPES",
            "data:read:arxiv data:read:twitter moderation:classify analysis:perform \
             insights:read contacts:write notification:send:slack",
        )
        .split_whitespace()
        .map(str::to_string)
        .collect();

        let digest_weekday = env_or("DIGEST_WEEKDAY", "Mon")
            .parse::<chrono::Weekday>()
            .unwrap_or(chrono::Weekday::Mon);

        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            db_path: env_or("VERITAS_DB", "./data/veritas.db"),

            jwks_url: env_or("JWKS_URL", "https://api.descope.com/v1/keys"),
            exchange_url: env_or(
                "EXCHANGE_URL",
                "https://api.descope.com/v1/auth/accesskey/exchange",
            ),
            service_access_key: env_or("SERVICE_ACCESS_KEY", ""),
            local_signing_secret: std::env::var("LOCAL_SIGNING_SECRET").ok(),
            jwks_cache_ttl: env_secs("JWKS_CACHE_TTL", 300),
            replay_ttl: env_secs("JTI_REPLAY_TTL", 300),
            clock_skew: env_secs("CLOCK_SKEW_SECS", 60),
            delegation_ttl: env_secs("DELEGATION_TTL", 300),
            mint_safety_buffer: env_secs("MINT_SAFETY_BUFFER", 30),
            audience_aliases,
            aud_scout,
            aud_moderator,
            aud_dispatcher,
            entitled_scopes,

            poll_interval: env_secs("SCOUT_POLL_INTERVAL", 60),
            rsshub_base: env_or("RSSHUB_BASE", "http://rsshub:1200"),

            llm_endpoint: env_or(
                "LLM_ENDPOINT",
                "https://api.groq.com/openai/v1/chat/completions",
            ),
            llm_model: env_or("LLM_MODEL", "openai/gpt-oss-120b"),
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_timeout: env_secs("LLM_TIMEOUT", 30),
            llm_call_delay: Duration::from_millis(env_parse("LLM_CALL_DELAY_MS", 2_000)),

            smtp_host: env_or("SMTP_HOST", ""),
            smtp_user: env_or("SMTP_USER", ""),
            smtp_pass: env_or("SMTP_PASS", ""),
            digest_from: env_or("DIGEST_EMAIL_FROM", "digest@veritas.local"),
            digest_weekday,
            digest_hour: env_parse("DIGEST_HOUR_UTC", 8),
            digest_top_n: env_parse("DIGEST_TOP_N", 5),
            batcher_tick: env_secs("BATCHER_TICK_SECS", 300),
        }
    }
}
