// src/auth/claims.rs
//! Claim set carried by a delegated credential.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// `aud` may be a single identifier or a list, depending on the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, wanted: &str) -> bool {
        match self {
            Audience::One(a) => a == wanted,
            Audience::Many(list) => list.iter().any(|a| a == wanted),
        }
    }
}

/// Nested claim block used by some issuer conventions (`nsec.scope`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NestedClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// The verified claim set of a delegated credential. All fields optional at
/// the serde level; the validator enforces which ones must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegatedClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsec: Option<NestedClaims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl DelegatedClaims {
    /// Scopes may appear under more than one claim name depending on issuer
    /// convention; the first recognized location wins.
    pub fn scope_claim(&self) -> Option<&str> {
        self.nsec
            .as_ref()
            .and_then(|n| n.scope.as_deref())
            .or(self.scope.as_deref())
            .or(self.scp.as_deref())
            .or(self.scopes.as_deref())
    }

    /// Whitespace-split granted scope set.
    pub fn granted_scopes(&self) -> HashSet<String> {
        self.scope_claim()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope_claim()
            .unwrap_or_default()
            .split_whitespace()
            .any(|s| s == scope)
    }
}
