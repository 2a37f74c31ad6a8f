// src/auth/issuer.rs
//! Credential issuance: validates an end-user session, then exchanges the
//! held long-lived service credential for a short-lived delegated credential
//! bound to a target audience and scope set.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::auth::claims::{Audience, DelegatedClaims};
use crate::auth::validator::{CredentialValidator, Expectations};
use crate::error::{AuthError, AuthResult};

/// A freshly minted delegated credential.
#[derive(Debug, Clone)]
pub struct MintedCredential {
    pub token: String,
    /// Unix seconds. Mint-cache reuse stops `safety_buffer` before this.
    pub expires_at: i64,
}

/// The exchange itself: turns (audience, scopes, ttl) into a signed token.
/// Production posts the access key to the identity provider; local/test mode
/// signs with a process-held secret.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn exchange(
        &self,
        audience: &str,
        scopes: &[String],
        ttl: Duration,
    ) -> AuthResult<MintedCredential>;
}

/// What the backing service credential is itself authorized to grant. The
/// issuer rejects any request outside this envelope; delegation can narrow,
/// never widen.
#[derive(Debug, Clone)]
pub struct ServiceEntitlements {
    pub audiences: HashSet<String>,
    pub scopes: HashSet<String>,
}

impl ServiceEntitlements {
    pub fn new<A, S>(audiences: A, scopes: S) -> Self
    where
        A: IntoIterator<Item = String>,
        S: IntoIterator<Item = String>,
    {
        Self {
            audiences: audiences.into_iter().collect(),
            scopes: scopes.into_iter().collect(),
        }
    }
}

pub struct CredentialIssuer {
    broker: Box<dyn TokenBroker>,
    validator: std::sync::Arc<CredentialValidator>,
    aliases: HashMap<String, String>,
    entitlements: ServiceEntitlements,
    default_ttl: Duration,
    safety_buffer: Duration,
    // Minted credentials keyed by (requesting entity, audience), reused until
    // near expiry to avoid an exchange round-trip on every pipeline tick.
    mint_cache: Mutex<HashMap<(String, String), MintedCredential>>,
}

impl CredentialIssuer {
    pub fn new(
        broker: Box<dyn TokenBroker>,
        validator: std::sync::Arc<CredentialValidator>,
        aliases: HashMap<String, String>,
        entitlements: ServiceEntitlements,
        default_ttl: Duration,
        safety_buffer: Duration,
    ) -> Self {
        Self {
            broker,
            validator,
            aliases,
            entitlements,
            default_ttl,
            safety_buffer,
            mint_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a friendly alias through the static table, falling back to the
    /// literal value when it is itself a well-formed audience identifier.
    fn resolve_audience(&self, target: &str) -> AuthResult<String> {
        if let Some(aud) = self.aliases.get(target) {
            return Ok(aud.clone());
        }
        let trimmed = target.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(AuthError::InvalidAudience(target.to_string()));
        }
        Ok(trimmed.to_string())
    }

    fn check_entitlement(&self, audience: &str, scopes: &[String]) -> AuthResult<()> {
        if !self.entitlements.audiences.contains(audience) {
            return Err(AuthError::ScopeEscalation(format!(
                "audience {audience} not entitled"
            )));
        }
        if let Some(outside) = scopes.iter().find(|s| !self.entitlements.scopes.contains(*s)) {
            return Err(AuthError::ScopeEscalation(format!(
                "scope {outside} not entitled"
            )));
        }
        Ok(())
    }

    /// The `delegate` operation: session-authenticated minting on behalf of
    /// an end user. The session credential is validated against the identity
    /// provider's key set; any credential fault maps to `Unauthenticated`.
    pub async fn delegate(
        &self,
        session_token: &str,
        target: &str,
        scopes: &[String],
        ttl: Option<Duration>,
    ) -> AuthResult<MintedCredential> {
        let session = self
            .validator
            .verify(session_token, &Expectations::default())
            .await
            .map_err(|e| match e {
                AuthError::UpstreamUnavailable(m) => AuthError::UpstreamUnavailable(m),
                AuthError::Internal(m) => AuthError::Internal(m),
                other => AuthError::Unauthenticated(format!("invalid session token: {other}")),
            })?;
        tracing::info!(
            target: "auth",
            sub = session.sub.as_deref().unwrap_or("<none>"),
            "validated session for delegation"
        );

        let audience = self.resolve_audience(target)?;
        self.check_entitlement(&audience, scopes)?;
        self.broker
            .exchange(&audience, scopes, ttl.unwrap_or(self.default_ttl))
            .await
    }

    /// Mint (or reuse) a delegated credential for a pipeline component acting
    /// under the service credential itself, with no end-user session involved.
    /// Cached per (entity, audience) until `safety_buffer` before expiry.
    pub async fn credential_for(
        &self,
        entity: &str,
        target: &str,
        scopes: &[String],
    ) -> AuthResult<MintedCredential> {
        let audience = self.resolve_audience(target)?;
        let key = (entity.to_string(), audience.clone());
        let now = chrono::Utc::now().timestamp();

        // Lock covers the lookup only; holding it across the exchange would
        // serialize every miss behind one broker round-trip. A raced miss can
        // mint twice, and the later insert wins.
        {
            let cache = self.mint_cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.expires_at - self.safety_buffer.as_secs() as i64 > now {
                    return Ok(cached.clone());
                }
            }
        }

        self.check_entitlement(&audience, scopes)?;
        let minted = self
            .broker
            .exchange(&audience, scopes, self.default_ttl)
            .await?;
        self.mint_cache.lock().await.insert(key, minted.clone());
        Ok(minted)
    }
}

// ── Brokers ──────────────────────────────────────────────────────────────

/// Signs delegated credentials with a process-held HS256 secret. Used in
/// local mode and tests; the matching JWKS comes from [`LocalSigner::jwk_set`].
pub struct LocalSigner {
    secret: Vec<u8>,
    kid: String,
    subject: String,
    authorized_party: String,
}

impl LocalSigner {
    pub fn new(secret: impl Into<Vec<u8>>, kid: &str, subject: &str, azp: &str) -> Self {
        Self {
            secret: secret.into(),
            kid: kid.to_string(),
            subject: subject.to_string(),
            authorized_party: azp.to_string(),
        }
    }

    /// JWKS document covering this signer's key, for wiring a validator.
    pub fn jwk_set_json(&self) -> serde_json::Value {
        let k = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&self.secret);
        serde_json::json!({ "keys": [{ "kty": "oct", "kid": self.kid, "k": k }] })
    }
}

#[async_trait]
impl TokenBroker for LocalSigner {
    async fn exchange(
        &self,
        audience: &str,
        scopes: &[String],
        ttl: Duration,
    ) -> AuthResult<MintedCredential> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;
        let claims = DelegatedClaims {
            sub: Some(self.subject.clone()),
            aud: Some(Audience::One(audience.to_string())),
            scope: (!scopes.is_empty()).then(|| scopes.join(" ")),
            azp: Some(self.authorized_party.clone()),
            iat: Some(now),
            exp: Some(expires_at),
            jti: Some(uuid::Uuid::new_v4().to_string()),
            ..Default::default()
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.kid.clone());
        let token = encode(&header, &claims, &EncodingKey::from_secret(&self.secret))
            .context("signing delegated credential")
            .map_err(AuthError::Internal)?;
        Ok(MintedCredential { token, expires_at })
    }
}

/// Exchanges the long-lived access key at the identity provider over HTTPS.
pub struct HttpTokenBroker {
    client: reqwest::Client,
    exchange_url: String,
    access_key: String,
}

impl HttpTokenBroker {
    pub fn new(exchange_url: impl Into<String>, access_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            exchange_url: exchange_url.into(),
            access_key: access_key.into(),
        }
    }
}

#[derive(Deserialize)]
struct ExchangeResponse {
    #[serde(alias = "sessionToken")]
    jwt: Option<String>,
    exp: Option<i64>,
}

#[async_trait]
impl TokenBroker for HttpTokenBroker {
    async fn exchange(
        &self,
        audience: &str,
        scopes: &[String],
        ttl: Duration,
    ) -> AuthResult<MintedCredential> {
        let body = serde_json::json!({
            "accessKey": self.access_key,
            "audience": audience,
            "scope": scopes.join(" "),
            "expiresIn": ttl.as_secs(),
        });
        let resp = self
            .client
            .post(&self.exchange_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(format!("exchange: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if text.to_ascii_lowercase().contains("audience") {
                return Err(AuthError::InvalidAudience(audience.to_string()));
            }
            return Err(AuthError::UpstreamUnavailable(format!(
                "exchange returned {status}: {text}"
            )));
        }

        let parsed: ExchangeResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(format!("exchange body: {e}")))?;
        let token = parsed
            .jwt
            .ok_or_else(|| AuthError::UpstreamUnavailable("exchange response missing jwt".into()))?;
        let expires_at = parsed
            .exp
            .unwrap_or_else(|| chrono::Utc::now().timestamp() + ttl.as_secs() as i64);
        Ok(MintedCredential { token, expires_at })
    }
}
