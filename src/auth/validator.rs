// src/auth/validator.rs
//! Offline verification of delegated credentials. This is the single trust
//! boundary every resource service relies on; all protected pipeline calls
//! go through [`CredentialValidator::verify`].

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use metrics::counter;

use crate::auth::claims::DelegatedClaims;
use crate::auth::jwks::JwksCache;
use crate::auth::replay::{ReplayMode, ReplayStore};
use crate::error::{AuthError, AuthResult};

/// What the caller requires of a presented credential.
#[derive(Debug, Clone, Default)]
pub struct Expectations<'a> {
    pub audience: Option<&'a str>,
    pub required_scopes: &'a [&'a str],
    pub authorized_party: Option<&'a str>,
    /// When set, the token's jti is consumed: a second presentation within
    /// the replay window fails with `ReplayDetected`. Pipeline-internal
    /// cached credentials are verified with this off, since they are minted
    /// for reuse until expiry.
    pub single_use: bool,
}

pub struct CredentialValidator {
    jwks: JwksCache,
    replay: Arc<dyn ReplayStore>,
    clock_skew: Duration,
    replay_ttl: Duration,
}

impl CredentialValidator {
    pub fn new(
        jwks: JwksCache,
        replay: Arc<dyn ReplayStore>,
        clock_skew: Duration,
        replay_ttl: Duration,
    ) -> Self {
        Self {
            jwks,
            replay,
            clock_skew,
            replay_ttl,
        }
    }

    /// Which replay-suppression guarantee is active (shared vs. degraded
    /// process-local fallback).
    pub fn replay_mode(&self) -> ReplayMode {
        self.replay.mode()
    }

    /// Verify `token` against the cached key set and `expect`, returning the
    /// verified claim set. Checks run in a fixed order so the most specific
    /// fault class wins: signature, expiry, audience, azp, scopes, replay.
    pub async fn verify(
        &self,
        token: &str,
        expect: &Expectations<'_>,
    ) -> AuthResult<DelegatedClaims> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("invalid token header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token missing kid".into()))?;

        let jwk = self
            .jwks
            .key_for(&kid)
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(format!("jwks: {e:#}")))?
            .ok_or_else(|| AuthError::InvalidToken("no matching jwk found".into()))?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::InvalidToken(format!("unusable jwk: {e}")))?;

        const ALLOWED: &[Algorithm] = &[
            Algorithm::HS256,
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
        ];
        if !ALLOWED.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        // Temporal and audience checks are done by hand below so each fault
        // maps to its own error class. The key was selected by kid from the
        // trusted set; the library still rejects a key/algorithm family
        // mismatch.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims::<&str>(&[]);

        let claims = decode::<DelegatedClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(format!("invalid token: {e}")))?
            .claims;

        let now = chrono::Utc::now().timestamp();
        match claims.exp {
            Some(exp) if exp > now => {}
            _ => return Err(AuthError::Expired),
        }
        if let Some(iat) = claims.iat {
            if iat > now + self.clock_skew.as_secs() as i64 {
                return Err(AuthError::NotYetValid);
            }
        }

        if let Some(expected_aud) = expect.audience {
            let ok = claims
                .aud
                .as_ref()
                .map(|aud| aud.contains(expected_aud))
                .unwrap_or(false);
            if !ok {
                return Err(AuthError::InvalidAudience(expected_aud.to_string()));
            }
        }

        if let Some(expected_azp) = expect.authorized_party {
            if claims.azp.as_deref() != Some(expected_azp) {
                return Err(AuthError::AzpMismatch);
            }
        }

        if !expect.required_scopes.is_empty() {
            let granted = claims.granted_scopes();
            if let Some(missing) = expect
                .required_scopes
                .iter()
                .find(|s| !granted.contains(**s))
            {
                return Err(AuthError::InsufficientScope((*missing).to_string()));
            }
        }

        if expect.single_use {
            if let Some(jti) = claims.jti.as_deref() {
                let first = self
                    .replay
                    .check_and_set(jti, self.replay_ttl)
                    .await
                    .map_err(AuthError::Internal)?;
                if !first {
                    counter!("replay_rejected_total").increment(1);
                    return Err(AuthError::ReplayDetected);
                }
            }
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::JwksFetch;
    use crate::auth::replay::InProcessReplayStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use base64::Engine as _;
    use jsonwebtoken::jwk::JwkSet;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"unit-test-secret";
    const KID: &str = "local-test";

    struct StaticFetcher;

    #[async_trait]
    impl JwksFetch for StaticFetcher {
        async fn fetch(&self) -> Result<JwkSet> {
            let k = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(SECRET);
            let set: JwkSet = serde_json::from_value(serde_json::json!({
                "keys": [{ "kty": "oct", "kid": KID, "k": k }]
            }))?;
            Ok(set)
        }
    }

    fn validator() -> CredentialValidator {
        CredentialValidator::new(
            JwksCache::new(Box::new(StaticFetcher), Duration::from_secs(300)),
            Arc::new(InProcessReplayStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    }

    fn sign(claims: &DelegatedClaims) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(KID.to_string());
        encode(&header, claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn base_claims() -> DelegatedClaims {
        let now = chrono::Utc::now().timestamp();
        DelegatedClaims {
            sub: Some("svc".into()),
            aud: Some(crate::auth::claims::Audience::One("veritas-moderator".into())),
            scope: Some("moderation:classify data:read:arxiv".into()),
            azp: Some("veritas-issuer".into()),
            iat: Some(now),
            exp: Some(now + 300),
            jti: Some(uuid::Uuid::new_v4().to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn valid_token_returns_claims() {
        let v = validator();
        let token = sign(&base_claims());
        let claims = v
            .verify(
                &token,
                &Expectations {
                    audience: Some("veritas-moderator"),
                    required_scopes: &["moderation:classify"],
                    authorized_party: Some("veritas-issuer"),
                    single_use: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(claims.sub.as_deref(), Some("svc"));
    }

    #[tokio::test]
    async fn expired_and_future_iat_are_distinct_faults() {
        let v = validator();
        let now = chrono::Utc::now().timestamp();

        let mut expired = base_claims();
        expired.exp = Some(now - 10);
        let err = v
            .verify(&sign(&expired), &Expectations::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired));

        let mut missing_exp = base_claims();
        missing_exp.exp = None;
        let err = v
            .verify(&sign(&missing_exp), &Expectations::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired));

        let mut future = base_claims();
        future.iat = Some(now + 120); // beyond the 60s skew allowance
        let err = v
            .verify(&sign(&future), &Expectations::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotYetValid));
    }

    #[tokio::test]
    async fn iat_within_skew_is_accepted() {
        let v = validator();
        let mut claims = base_claims();
        claims.iat = Some(chrono::Utc::now().timestamp() + 30);
        assert!(v.verify(&sign(&claims), &Expectations::default()).await.is_ok());
    }

    #[tokio::test]
    async fn audience_list_membership_is_checked() {
        let v = validator();
        let mut claims = base_claims();
        claims.aud = Some(crate::auth::claims::Audience::Many(vec![
            "other".into(),
            "veritas-moderator".into(),
        ]));
        let expect = Expectations {
            audience: Some("veritas-moderator"),
            ..Default::default()
        };
        assert!(v.verify(&sign(&claims), &expect).await.is_ok());

        let expect = Expectations {
            audience: Some("veritas-scout"),
            ..Default::default()
        };
        let err = v.verify(&sign(&claims), &expect).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidAudience(_)));
    }

    #[tokio::test]
    async fn azp_and_scope_faults() {
        let v = validator();
        let token = sign(&base_claims());

        let err = v
            .verify(
                &token,
                &Expectations {
                    authorized_party: Some("someone-else"),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AzpMismatch));

        let err = v
            .verify(
                &token,
                &Expectations {
                    required_scopes: &["notification:send:slack"],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InsufficientScope(_)));
    }

    #[tokio::test]
    async fn second_single_use_verification_is_a_replay() {
        let v = validator();
        let token = sign(&base_claims());
        let expect = Expectations {
            single_use: true,
            ..Default::default()
        };
        assert!(v.verify(&token, &expect).await.is_ok());
        let err = v.verify(&token, &expect).await.unwrap_err();
        assert!(matches!(err, AuthError::ReplayDetected));
    }

    #[tokio::test]
    async fn reusable_verification_accepts_the_same_jti_twice() {
        let v = validator();
        let token = sign(&base_claims());
        let expect = Expectations::default();
        assert!(v.verify(&token, &expect).await.is_ok());
        assert!(v.verify(&token, &expect).await.is_ok());
    }

    #[tokio::test]
    async fn garbage_and_unknown_kid_are_invalid_tokens() {
        let v = validator();
        let err = v
            .verify("not-a-jwt", &Expectations::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("unknown-kid".into());
        let token = encode(&header, &base_claims(), &EncodingKey::from_secret(SECRET)).unwrap();
        let err = v.verify(&token, &Expectations::default()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }
}
