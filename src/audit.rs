// src/audit.rs
//! Append-only audit trail. Every security-relevant and pipeline-state
//! changing action lands here; nothing in the system mutates or deletes rows.

use serde_json::Value;

use crate::store::Store;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: i64,
    pub actor: String,
    pub action: String,
    pub owner: Option<String>,
    pub audience: Option<String>,
    pub scope: Option<String>,
    pub jti: Option<String>,
    pub outcome: String,
    pub details: Option<Value>,
}

impl AuditEntry {
    pub fn new(actor: &str, action: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            actor: actor.to_string(),
            action: action.to_string(),
            owner: None,
            audience: None,
            scope: None,
            jti: None,
            outcome: "success".to_string(),
            details: None,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn jti(mut self, jti: Option<String>) -> Self {
        self.jti = jti;
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Thin recorder over the shared store. A persistence fault here is logged
/// and swallowed; the audit trail must never take down the pipeline.
#[derive(Clone)]
pub struct AuditLog {
    store: Store,
}

impl AuditLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.store.insert_audit(entry).await {
            tracing::error!(target: "audit", error = %e, action = %action, "audit insert failed");
        }
    }
}
