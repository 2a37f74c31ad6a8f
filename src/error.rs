//! Error taxonomy shared across the authorization layer and the pipeline.
//!
//! Authorization faults are surfaced to callers immediately and never retried;
//! upstream faults are retried locally with bounded backoff and then degrade
//! to a safe default per stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing or invalid session / bearer credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Structurally broken credential (header, kid, signature).
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    /// `iat` is further in the future than the clock-skew allowance.
    #[error("token not yet valid")]
    NotYetValid,

    #[error("invalid audience: {0}")]
    InvalidAudience(String),

    #[error("authorized party mismatch")]
    AzpMismatch,

    #[error("insufficient scope: missing {0}")]
    InsufficientScope(String),

    /// The issuer was asked for an audience or scope broader than its backing
    /// service credential is entitled to grant.
    #[error("scope escalation rejected: {0}")]
    ScopeEscalation(String),

    /// A jti was presented twice within the replay window. Always fatal.
    #[error("replay detected")]
    ReplayDetected,

    /// Feed / LLM / mail transport failure. Retried with backoff by callers.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness invariant violated (e.g. duplicate subscription).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable class name, used in API bodies and audit rows.
    pub fn class(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated(_) => "unauthenticated",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::Expired => "expired",
            AuthError::NotYetValid => "not_yet_valid",
            AuthError::InvalidAudience(_) => "invalid_audience",
            AuthError::AzpMismatch => "azp_mismatch",
            AuthError::InsufficientScope(_) => "insufficient_scope",
            AuthError::ScopeEscalation(_) => "scope_escalation",
            AuthError::ReplayDetected => "replay_detected",
            AuthError::UpstreamUnavailable(_) => "upstream_unavailable",
            AuthError::NotFound(_) => "not_found",
            AuthError::Conflict(_) => "conflict",
            AuthError::Internal(_) => "internal",
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
