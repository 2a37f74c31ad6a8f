// src/store/mod.rs
//! SQLite persistence for the pipeline.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Cloning is cheap; the inner
//! connection is reference-counted.

mod schema;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::audit::AuditEntry;
use schema::SCHEMA;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness invariant violated.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

fn is_constraint(e: &tokio_rusqlite::Error) -> bool {
    matches!(
        e,
        tokio_rusqlite::Error::Rusqlite(re)
            if re.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---- Row types ----

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub id: i64,
    pub owner: String,
    pub source: String,
    pub endpoint: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub subscription_id: i64,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: i64,
    pub subscription_id: i64,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub fetch_time: i64,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct ModerationRecord {
    pub subscription_id: Option<i64>,
    pub item_title: String,
    pub item_url: String,
    pub content_hash: String,
    pub content_snippet: String,
    pub allowed: bool,
    pub categories: Vec<String>,
    pub reason: String,
    pub model_response: String,
}

/// One recorded moderation outcome for a piece of content.
#[derive(Debug, Clone)]
pub struct ModerationVerdict {
    pub allowed: bool,
    pub reason: String,
    /// The gate failed closed without any model output (timeout or upstream
    /// outage). Such verdicts are not genuine classifications and must not
    /// be reused for later sightings of the same content.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct NewInsight {
    pub insight_type: String,
    pub score: f64,
    pub summary: String,
    pub evidence_json: String,
    pub recommended_action: String,
    pub raw_response: Option<String>,
    pub subscription_id: i64,
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct InsightRow {
    pub id: i64,
    pub insight_type: String,
    pub score: f64,
    pub summary: String,
    pub evidence_json: String,
    pub recommended_action: String,
    pub subscription_id: i64,
    pub owner: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct PendingRow {
    pub owner: String,
    pub subscription_id: i64,
    pub insight_id: i64,
    pub score: f64,
    pub created_at: i64,
}

/// A pipeline store backed by a single SQLite file.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (or create) a store at `path` and run schema initialisation.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory store, useful for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Insert a subscription; `Conflict` on the (owner, source, endpoint)
    /// uniqueness invariant.
    pub async fn insert_subscription(
        &self,
        owner: &str,
        source: &str,
        endpoint: &str,
    ) -> Result<i64> {
        let (owner, source, endpoint) =
            (owner.to_string(), source.to_string(), endpoint.to_string());
        let created = now_unix();
        let res = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subscriptions (owner, source, endpoint, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![owner, source, endpoint, created],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await;
        match res {
            Ok(id) => Ok(id),
            Err(e) if is_constraint(&e) => {
                Err(StoreError::Conflict("subscription already exists".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<SubscriptionRow>> {
        let row = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                let row = conn
                    .query_row(
                        "SELECT id, owner, source, endpoint, created_at
                         FROM subscriptions WHERE id = ?1",
                        rusqlite::params![id],
                        map_subscription,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    pub async fn list_subscriptions(&self, owner: Option<String>) -> Result<Vec<SubscriptionRow>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut out = Vec::new();
                match owner {
                    Some(owner) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, owner, source, endpoint, created_at
                             FROM subscriptions WHERE owner = ?1 ORDER BY id",
                        )?;
                        let iter = stmt.query_map(rusqlite::params![owner], map_subscription)?;
                        for r in iter {
                            out.push(r?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, owner, source, endpoint, created_at
                             FROM subscriptions ORDER BY id",
                        )?;
                        let iter = stmt.query_map([], map_subscription)?;
                        for r in iter {
                            out.push(r?);
                        }
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Delete a subscription, returning the removed row (None if absent).
    pub async fn delete_subscription(&self, id: i64) -> Result<Option<SubscriptionRow>> {
        let row = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                let row = conn
                    .query_row(
                        "SELECT id, owner, source, endpoint, created_at
                         FROM subscriptions WHERE id = ?1",
                        rusqlite::params![id],
                        map_subscription,
                    )
                    .optional()?;
                if row.is_some() {
                    conn.execute(
                        "DELETE FROM subscriptions WHERE id = ?1",
                        rusqlite::params![id],
                    )?;
                }
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    // ── Items / fingerprint index ────────────────────────────────────────

    pub async fn fingerprint_seen(&self, source: &str, fingerprint: &str) -> Result<bool> {
        let (source, fingerprint) = (source.to_string(), fingerprint.to_string());
        let seen = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                let hit: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM items WHERE source = ?1 AND fingerprint = ?2",
                        rusqlite::params![source, fingerprint],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(hit.is_some())
            })
            .await?;
        Ok(seen)
    }

    /// Idempotent insert: returns `None` when the fingerprint already exists
    /// for this source, so a raced duplicate never yields a second row.
    pub async fn insert_item(&self, item: NewItem) -> Result<Option<i64>> {
        let fetch_time = now_unix();
        let id = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO items
                     (subscription_id, source, source_id, title, body, url, fetch_time, fingerprint)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        item.subscription_id,
                        item.source,
                        item.source_id,
                        item.title,
                        item.body,
                        item.url,
                        fetch_time,
                        item.fingerprint,
                    ],
                )?;
                if changed == 0 {
                    Ok(None)
                } else {
                    Ok(Some(conn.last_insert_rowid()))
                }
            })
            .await?;
        Ok(id)
    }

    pub async fn load_item(&self, id: i64) -> Result<Option<ItemRow>> {
        let row = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                let row = conn
                    .query_row(
                        "SELECT id, subscription_id, source, source_id, title, body, url,
                                fetch_time, fingerprint
                         FROM items WHERE id = ?1",
                        rusqlite::params![id],
                        |r| {
                            Ok(ItemRow {
                                id: r.get(0)?,
                                subscription_id: r.get(1)?,
                                source: r.get(2)?,
                                source_id: r.get(3)?,
                                title: r.get(4)?,
                                body: r.get(5)?,
                                url: r.get(6)?,
                                fetch_time: r.get(7)?,
                                fingerprint: r.get(8)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    pub async fn count_items(&self) -> Result<i64> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    // ── Moderation log (append-only) ─────────────────────────────────────

    pub async fn insert_moderation(&self, rec: ModerationRecord) -> Result<i64> {
        let requested_at = now_unix();
        let categories =
            serde_json::to_string(&rec.categories).unwrap_or_else(|_| "[]".to_string());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO moderation_logs
                     (subscription_id, item_title, item_url, content_hash, content_snippet,
                      requested_at, decision_allowed, categories, reason, model_response)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        rec.subscription_id,
                        rec.item_title,
                        rec.item_url,
                        rec.content_hash,
                        rec.content_snippet,
                        requested_at,
                        rec.allowed as i64,
                        categories,
                        rec.reason,
                        rec.model_response,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Audit lookup: every decision recorded for a content hash, oldest first.
    pub async fn moderation_by_hash(&self, hash: &str) -> Result<Vec<ModerationVerdict>> {
        let hash = hash.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT decision_allowed, reason, model_response FROM moderation_logs
                     WHERE content_hash = ?1 ORDER BY id",
                )?;
                let iter = stmt.query_map(rusqlite::params![hash], |r| {
                    Ok(ModerationVerdict {
                        allowed: r.get::<_, i64>(0)? != 0,
                        reason: r.get(1)?,
                        degraded: r.get::<_, String>(2)?.is_empty(),
                    })
                })?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // ── Insights ─────────────────────────────────────────────────────────

    pub async fn insert_insight(&self, ins: NewInsight) -> Result<i64> {
        let created = now_unix();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO insights
                     (insight_type, score, summary, evidence, recommended_action, raw_response,
                      subscription_id, owner, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        ins.insight_type,
                        ins.score,
                        ins.summary,
                        ins.evidence_json,
                        ins.recommended_action,
                        ins.raw_response,
                        ins.subscription_id,
                        ins.owner,
                        created,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn list_insights(&self, limit: usize) -> Result<Vec<InsightRow>> {
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, insight_type, score, summary, evidence, recommended_action,
                            subscription_id, owner, created_at
                     FROM insights ORDER BY created_at DESC, id DESC LIMIT ?1",
                )?;
                let iter = stmt.query_map(rusqlite::params![limit], map_insight)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Newest insights for one owner. The owner filter runs in SQL so other
    /// tenants' rows never eat into the page.
    pub async fn list_insights_for_owner(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<InsightRow>> {
        let owner = owner.to_string();
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, insight_type, score, summary, evidence, recommended_action,
                            subscription_id, owner, created_at
                     FROM insights WHERE owner = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                let iter = stmt.query_map(rusqlite::params![owner, limit], map_insight)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn get_insight(&self, id: i64) -> Result<Option<InsightRow>> {
        let row = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                let row = conn
                    .query_row(
                        "SELECT id, insight_type, score, summary, evidence, recommended_action,
                                subscription_id, owner, created_at
                         FROM insights WHERE id = ?1",
                        rusqlite::params![id],
                        map_insight,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    // ── Pending dispatch ─────────────────────────────────────────────────

    pub async fn append_pending(
        &self,
        owner: &str,
        subscription_id: i64,
        insight_id: i64,
        score: f64,
    ) -> Result<()> {
        let owner = owner.to_string();
        let created = now_unix();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pending_dispatch
                     (owner, subscription_id, insight_id, score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![owner, subscription_id, insight_id, score, created],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingRow>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT owner, subscription_id, insight_id, score, created_at
                     FROM pending_dispatch ORDER BY id",
                )?;
                let iter = stmt.query_map([], |r| {
                    Ok(PendingRow {
                        owner: r.get(0)?,
                        subscription_id: r.get(1)?,
                        insight_id: r.get(2)?,
                        score: r.get(3)?,
                        created_at: r.get(4)?,
                    })
                })?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Clears every pending row, not just the delivered groups.
    pub async fn clear_pending(&self) -> Result<usize> {
        let n = self
            .conn
            .call(|conn| {
                let n = conn.execute("DELETE FROM pending_dispatch", [])?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    // ── Contacts / digests ───────────────────────────────────────────────

    pub async fn upsert_contact(&self, owner: &str, address: &str) -> Result<()> {
        let (owner, address) = (owner.to_string(), address.to_string());
        let updated = now_unix();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO contacts (owner, address, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(owner) DO UPDATE SET address = ?2, updated_at = ?3",
                    rusqlite::params![owner, address, updated],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_contact(&self, owner: &str) -> Result<Option<String>> {
        let owner = owner.to_string();
        let addr = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                let addr: Option<String> = conn
                    .query_row(
                        "SELECT address FROM contacts WHERE owner = ?1",
                        rusqlite::params![owner],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(addr)
            })
            .await?;
        Ok(addr)
    }

    pub async fn record_digest(
        &self,
        owner: &str,
        subscription_id: i64,
        insight_count: usize,
    ) -> Result<()> {
        let owner = owner.to_string();
        let sent = now_unix();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sent_digests (owner, subscription_id, insight_count, sent_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![owner, subscription_id, insight_count as i64, sent],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn count_digests(&self) -> Result<i64> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM sent_digests", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    // ── Audit log ────────────────────────────────────────────────────────

    pub async fn insert_audit(&self, entry: AuditEntry) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log
                     (timestamp, actor, action, owner, audience, scope, jti, outcome, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        entry.timestamp,
                        entry.actor,
                        entry.action,
                        entry.owner,
                        entry.audience,
                        entry.scope,
                        entry.jti,
                        entry.outcome,
                        entry.details.map(|d| d.to_string()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_audit_actions(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT actor, action FROM audit_log ORDER BY id DESC LIMIT ?1",
                )?;
                let iter = stmt.query_map(rusqlite::params![limit], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // ── Replay window ────────────────────────────────────────────────────

    /// Atomic test-and-set of a jti within the replay window. Expired rows
    /// are reaped on every call.
    pub async fn replay_check_and_set(&self, jti: &str, ttl: Duration) -> Result<bool> {
        let jti = jti.to_string();
        let now = now_unix();
        let expires = now + ttl.as_secs() as i64;
        let first = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM seen_jti WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?;
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO seen_jti (jti, expires_at) VALUES (?1, ?2)",
                    rusqlite::params![jti, expires],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(first)
    }
}

fn map_subscription(r: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: r.get(0)?,
        owner: r.get(1)?,
        source: r.get(2)?,
        endpoint: r.get(3)?,
        created_at: r.get(4)?,
    })
}

fn map_insight(r: &rusqlite::Row<'_>) -> rusqlite::Result<InsightRow> {
    Ok(InsightRow {
        id: r.get(0)?,
        insight_type: r.get(1)?,
        score: r.get(2)?,
        summary: r.get(3)?,
        evidence_json: r.get(4)?,
        recommended_action: r.get(5)?,
        subscription_id: r.get(6)?,
        owner: r.get(7)?,
        created_at: r.get(8)?,
    })
}
