//! SQL schema for the pipeline store.
//!
//! One SQLite file holds every table; each service touches only its own
//! tables, cross-table joins are best-effort.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS subscriptions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    owner      TEXT NOT NULL,
    source     TEXT NOT NULL,      -- 'arxiv' | 'twitter'
    endpoint   TEXT NOT NULL,      -- normalized feed URL
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS subscriptions_owner_source_endpoint
    ON subscriptions(owner, source, endpoint);

CREATE TABLE IF NOT EXISTS items (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER,       -- weak reference; subscription may be gone
    source          TEXT NOT NULL,
    source_id       TEXT,
    title           TEXT,
    body            TEXT,
    url             TEXT,
    fetch_time      INTEGER,
    fingerprint     TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS items_source_fingerprint
    ON items(source, fingerprint);
CREATE INDEX IF NOT EXISTS items_subscription_idx ON items(subscription_id);

-- Append-only. No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS moderation_logs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id  INTEGER,
    item_title       TEXT,
    item_url         TEXT,
    content_hash     TEXT NOT NULL,
    content_snippet  TEXT,
    requested_at     INTEGER NOT NULL,
    decision_allowed INTEGER NOT NULL,
    categories       TEXT,          -- JSON array of strings
    reason           TEXT,
    model_response   TEXT,
    created_at       INTEGER DEFAULT (strftime('%s','now'))
);
CREATE INDEX IF NOT EXISTS moderation_logs_content_hash
    ON moderation_logs(content_hash);

CREATE TABLE IF NOT EXISTS insights (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    insight_type       TEXT,
    score              REAL,
    summary            TEXT,
    evidence           TEXT,        -- JSON array
    recommended_action TEXT,
    raw_response       TEXT,
    subscription_id    INTEGER,
    owner              TEXT,
    created_at         INTEGER
);

CREATE TABLE IF NOT EXISTS pending_dispatch (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    owner           TEXT NOT NULL,
    subscription_id INTEGER NOT NULL,
    insight_id      INTEGER NOT NULL,
    score           REAL NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
    owner      TEXT PRIMARY KEY,
    address    TEXT NOT NULL,      -- email address or webhook URL
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sent_digests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    owner           TEXT NOT NULL,
    subscription_id INTEGER NOT NULL,
    insight_count   INTEGER NOT NULL,
    sent_at         INTEGER NOT NULL
);

-- Append-only security and pipeline-state audit trail.
CREATE TABLE IF NOT EXISTS audit_log (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    actor     TEXT NOT NULL,
    action    TEXT NOT NULL,
    owner     TEXT,
    audience  TEXT,
    scope     TEXT,
    jti       TEXT,
    outcome   TEXT NOT NULL,
    details   TEXT                 -- JSON object
);

-- Replay-suppression window; rows expire and are reaped on access.
CREATE TABLE IF NOT EXISTS seen_jti (
    jti        TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
";
