// src/api.rs
//! HTTP surface. Every route except /health takes a bearer credential;
//! tokens presented here are consumed (single use) so a captured request
//! cannot be replayed.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics::counter;
use tower_http::cors::CorsLayer;

use crate::audit::{AuditEntry, AuditLog};
use crate::auth::{CredentialIssuer, CredentialValidator, Expectations};
use crate::error::{AuthError, AuthResult};
use crate::ingest::normalize::SourceKind;
use crate::ingest::PollerRegistry;
use crate::moderate::{ModerationHandle, MODERATION_SCOPE};
use crate::queue::{ModerationDecision, ModerationRequest};
use crate::store::{Store, StoreError, SubscriptionRow};

pub const INSIGHTS_SCOPE: &str = "insights:read";
pub const CONTACTS_SCOPE: &str = "contacts:write";

#[derive(Clone)]
pub struct Audiences {
    pub scout: String,
    pub moderator: String,
    pub analyst: String,
    pub dispatcher: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub validator: Arc<CredentialValidator>,
    pub issuer: Arc<CredentialIssuer>,
    pub moderation: ModerationHandle,
    pub pollers: Arc<PollerRegistry>,
    pub audit: AuditLog,
    pub audiences: Audiences,
    pub rsshub_base: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/subscribe", post(subscribe))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/{id}", delete(unsubscribe))
        .route("/delegate", post(delegate))
        .route("/moderate", post(moderate_adhoc))
        .route("/insights", get(list_insights))
        .route("/contacts", post(upsert_contact))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::Unauthenticated(_)
            | AuthError::InvalidToken(_)
            | AuthError::Expired
            | AuthError::NotYetValid
            | AuthError::ReplayDetected => StatusCode::UNAUTHORIZED,
            AuthError::InvalidAudience(_)
            | AuthError::AzpMismatch
            | AuthError::InsufficientScope(_)
            | AuthError::ScopeEscalation(_) => StatusCode::FORBIDDEN,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            counter!("auth_failures_total", "class" => self.class()).increment(1);
        }
        let body = Json(serde_json::json!({
            "error": self.class(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> AuthResult<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::Unauthenticated("missing bearer token".into()))
}

fn map_store(e: StoreError) -> AuthError {
    match e {
        StoreError::Conflict(m) => AuthError::Conflict(m),
        StoreError::Database(e) => AuthError::Internal(anyhow::Error::new(e)),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().timestamp(),
    }))
}

// ── Subscriptions ────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct SubscribeReq {
    source: String,
    endpoint: String,
}

#[derive(serde::Serialize)]
struct SubscriptionOut {
    id: i64,
    owner: String,
    source: String,
    endpoint: String,
}

impl From<SubscriptionRow> for SubscriptionOut {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            owner: row.owner,
            source: row.source,
            endpoint: row.endpoint,
        }
    }
}

async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubscribeReq>,
) -> AuthResult<(StatusCode, Json<SubscriptionOut>)> {
    let kind: SourceKind = body
        .source
        .parse()
        .map_err(|_| AuthError::NotFound(format!("unsupported source: {}", body.source)))?;

    let claims = state
        .validator
        .verify(
            bearer(&headers)?,
            &Expectations {
                audience: Some(&state.audiences.scout),
                required_scopes: &[kind.required_scope()],
                single_use: true,
                ..Default::default()
            },
        )
        .await?;
    let owner = claims
        .sub
        .ok_or_else(|| AuthError::Unauthenticated("credential has no subject".into()))?;

    let endpoint = kind.normalize_endpoint(&body.endpoint, &state.rsshub_base);
    let id = state
        .store
        .insert_subscription(&owner, kind.as_str(), &endpoint)
        .await
        .map_err(map_store)?;
    let row = SubscriptionRow {
        id,
        owner: owner.clone(),
        source: kind.as_str().to_string(),
        endpoint: endpoint.clone(),
        created_at: chrono::Utc::now().timestamp(),
    };
    state.pollers.start(row.clone()).await;

    state
        .audit
        .record(
            AuditEntry::new("scout", "subscribe")
                .owner(&owner)
                .audience(&state.audiences.scout)
                .scope(kind.required_scope())
                .details(serde_json::json!({ "subscription_id": id, "endpoint": endpoint })),
        )
        .await;
    Ok((StatusCode::CREATED, Json(row.into())))
}

/// Any data-read scope grants visibility of the caller's own subscriptions.
fn require_any_read_scope(claims: &crate::auth::DelegatedClaims) -> AuthResult<()> {
    let has_read = claims
        .granted_scopes()
        .iter()
        .any(|s| s.starts_with("data:read:"));
    if !has_read {
        return Err(AuthError::InsufficientScope("data:read:*".into()));
    }
    Ok(())
}

async fn list_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AuthResult<Json<Vec<SubscriptionOut>>> {
    let claims = state
        .validator
        .verify(
            bearer(&headers)?,
            &Expectations {
                audience: Some(&state.audiences.scout),
                single_use: true,
                ..Default::default()
            },
        )
        .await?;
    require_any_read_scope(&claims)?;
    let owner = claims
        .sub
        .ok_or_else(|| AuthError::Unauthenticated("credential has no subject".into()))?;

    let rows = state
        .store
        .list_subscriptions(Some(owner))
        .await
        .map_err(map_store)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

#[derive(serde::Serialize)]
struct UnsubscribeOut {
    removed: bool,
}

async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AuthResult<Json<UnsubscribeOut>> {
    let claims = state
        .validator
        .verify(
            bearer(&headers)?,
            &Expectations {
                audience: Some(&state.audiences.scout),
                single_use: true,
                ..Default::default()
            },
        )
        .await?;
    require_any_read_scope(&claims)?;
    let owner = claims
        .sub
        .ok_or_else(|| AuthError::Unauthenticated("credential has no subject".into()))?;

    // Ownership is checked before deletion; a foreign id reads as absent.
    let removed = match state.store.get_subscription(id).await.map_err(map_store)? {
        Some(sub) if sub.owner == owner => {
            state.pollers.stop(id).await;
            state
                .store
                .delete_subscription(id)
                .await
                .map_err(map_store)?
                .is_some()
        }
        _ => false,
    };

    if removed {
        state
            .audit
            .record(
                AuditEntry::new("scout", "unsubscribe")
                    .owner(&owner)
                    .details(serde_json::json!({ "subscription_id": id })),
            )
            .await;
    }
    // Idempotent: deleting an absent subscription is not an error.
    Ok(Json(UnsubscribeOut { removed }))
}

// ── Delegation ───────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct DelegateReq {
    target: String,
    scopes: Vec<String>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

#[derive(serde::Serialize)]
struct DelegateResp {
    token: String,
    expires_at: i64,
}

async fn delegate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DelegateReq>,
) -> AuthResult<Json<DelegateResp>> {
    let session = bearer(&headers)?;
    let minted = state
        .issuer
        .delegate(
            session,
            &body.target,
            &body.scopes,
            body.ttl_secs.map(std::time::Duration::from_secs),
        )
        .await;

    let outcome = match &minted {
        Ok(_) => "success".to_string(),
        Err(e) => e.class().to_string(),
    };
    state
        .audit
        .record(
            AuditEntry::new("concierge", "delegate")
                .audience(&body.target)
                .scope(body.scopes.join(" "))
                .outcome(outcome),
        )
        .await;

    let minted = minted?;
    Ok(Json(DelegateResp {
        token: minted.token,
        expires_at: minted.expires_at,
    }))
}

// ── Moderation (ad hoc) ──────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct ModerateReq {
    #[serde(default)]
    title: String,
    body: String,
    #[serde(default)]
    url: String,
}

async fn moderate_adhoc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ModerateReq>,
) -> AuthResult<Json<ModerationDecision>> {
    state
        .validator
        .verify(
            bearer(&headers)?,
            &Expectations {
                audience: Some(&state.audiences.moderator),
                required_scopes: &[MODERATION_SCOPE],
                single_use: true,
                ..Default::default()
            },
        )
        .await?;

    let decision = state
        .moderation
        .submit(ModerationRequest {
            subscription_id: None,
            title: body.title,
            body: body.body,
            url: body.url,
        })
        .await?;
    Ok(Json(decision))
}

// ── Insights ─────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct InsightsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(serde::Serialize)]
struct InsightOut {
    id: i64,
    #[serde(rename = "type")]
    insight_type: String,
    score: f64,
    summary: String,
    evidence: serde_json::Value,
    recommended_action: String,
    subscription_id: i64,
    created_at: i64,
}

async fn list_insights(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<InsightsQuery>,
) -> AuthResult<Json<Vec<InsightOut>>> {
    let claims = state
        .validator
        .verify(
            bearer(&headers)?,
            &Expectations {
                audience: Some(&state.audiences.analyst),
                required_scopes: &[INSIGHTS_SCOPE],
                single_use: true,
                ..Default::default()
            },
        )
        .await?;
    let owner = claims
        .sub
        .ok_or_else(|| AuthError::Unauthenticated("credential has no subject".into()))?;

    let limit = q.limit.unwrap_or(20).min(200);
    let rows = state
        .store
        .list_insights_for_owner(&owner, limit)
        .await
        .map_err(map_store)?;
    let out = rows
        .into_iter()
        .map(|r| InsightOut {
            id: r.id,
            insight_type: r.insight_type,
            score: r.score,
            summary: r.summary,
            evidence: serde_json::from_str(&r.evidence_json)
                .unwrap_or(serde_json::Value::Array(Vec::new())),
            recommended_action: r.recommended_action,
            subscription_id: r.subscription_id,
            created_at: r.created_at,
        })
        .collect();
    Ok(Json(out))
}

// ── Contacts ─────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct ContactReq {
    address: String,
}

async fn upsert_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ContactReq>,
) -> AuthResult<StatusCode> {
    let claims = state
        .validator
        .verify(
            bearer(&headers)?,
            &Expectations {
                audience: Some(&state.audiences.dispatcher),
                required_scopes: &[CONTACTS_SCOPE],
                single_use: true,
                ..Default::default()
            },
        )
        .await?;
    let owner = claims
        .sub
        .ok_or_else(|| AuthError::Unauthenticated("credential has no subject".into()))?;

    let address = body.address.trim();
    if address.is_empty() {
        return Err(AuthError::Conflict("contact address is empty".into()));
    }
    state
        .store
        .upsert_contact(&owner, address)
        .await
        .map_err(map_store)?;

    state
        .audit
        .record(
            AuditEntry::new("dispatcher", "contact.updated")
                .owner(&owner)
                .scope(CONTACTS_SCOPE),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}
