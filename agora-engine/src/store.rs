//! Shared persistent store
//!
//! A single SQLite database file holds every service's tables, partitioned
//! by name prefix (`identity_*`, `bank_*`, `board_*`, `reputation_*`,
//! `court_*`, `events`). Writes to a table belong to its owning service;
//! the unique indexes below are the at-most-once tokens the application
//! relies on instead of in-process locking.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use agora_core::EconomyResult;

/// Table and index definitions, one statement per entry.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS identity_agents (
        agent_id      TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        public_key    TEXT NOT NULL UNIQUE,
        registered_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS bank_accounts (
        account_id TEXT PRIMARY KEY REFERENCES identity_agents(agent_id),
        balance    INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS bank_transactions (
        tx_id             TEXT PRIMARY KEY,
        account_id        TEXT NOT NULL REFERENCES bank_accounts(account_id),
        kind              TEXT NOT NULL,
        amount            INTEGER NOT NULL CHECK (amount > 0),
        resulting_balance INTEGER NOT NULL,
        reference         TEXT NOT NULL,
        created_at        TEXT NOT NULL
    )",
    // Credit idempotency: replaying (account, reference) is a no-op.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_bank_credit_once
        ON bank_transactions(account_id, reference) WHERE kind = 'credit'",
    "CREATE TABLE IF NOT EXISTS bank_escrows (
        escrow_id        TEXT PRIMARY KEY,
        payer_account_id TEXT NOT NULL REFERENCES bank_accounts(account_id),
        amount           INTEGER NOT NULL CHECK (amount > 0),
        task_id          TEXT NOT NULL,
        status           TEXT NOT NULL,
        created_at       TEXT NOT NULL,
        resolved_at      TEXT
    )",
    // At most one active lock per (payer, task).
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_bank_escrow_active
        ON bank_escrows(payer_account_id, task_id) WHERE status = 'locked'",
    "CREATE TABLE IF NOT EXISTS board_tasks (
        task_id            TEXT PRIMARY KEY,
        poster_id          TEXT NOT NULL REFERENCES identity_agents(agent_id),
        title              TEXT NOT NULL,
        spec               TEXT NOT NULL,
        reward             INTEGER NOT NULL CHECK (reward > 0),
        bidding_seconds    INTEGER NOT NULL,
        execution_seconds  INTEGER NOT NULL,
        review_seconds     INTEGER NOT NULL,
        bidding_deadline   TEXT NOT NULL,
        execution_deadline TEXT,
        review_deadline    TEXT,
        escrow_id          TEXT NOT NULL,
        worker_id          TEXT,
        accepted_bid_id    TEXT,
        dispute_reason     TEXT,
        ruling_id          TEXT,
        worker_pct         INTEGER,
        ruling_summary     TEXT,
        status             TEXT NOT NULL,
        expired_reason     TEXT,
        created_at         TEXT NOT NULL,
        accepted_at        TEXT,
        submitted_at       TEXT,
        approved_at        TEXT,
        cancelled_at       TEXT,
        disputed_at        TEXT,
        ruled_at           TEXT,
        expired_at         TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_board_tasks_status ON board_tasks(status)",
    "CREATE TABLE IF NOT EXISTS board_bids (
        bid_id       TEXT PRIMARY KEY,
        task_id      TEXT NOT NULL REFERENCES board_tasks(task_id),
        bidder_id    TEXT NOT NULL REFERENCES identity_agents(agent_id),
        proposal     TEXT NOT NULL,
        submitted_at TEXT NOT NULL,
        UNIQUE (task_id, bidder_id)
    )",
    "CREATE TABLE IF NOT EXISTS board_assets (
        asset_id     TEXT PRIMARY KEY,
        task_id      TEXT NOT NULL REFERENCES board_tasks(task_id),
        uploader_id  TEXT NOT NULL,
        filename     TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size_bytes   INTEGER NOT NULL,
        storage_path TEXT NOT NULL,
        uploaded_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS reputation_feedback (
        feedback_id   TEXT PRIMARY KEY,
        task_id       TEXT NOT NULL REFERENCES board_tasks(task_id),
        from_agent_id TEXT NOT NULL,
        to_agent_id   TEXT NOT NULL,
        role          TEXT NOT NULL,
        category      TEXT NOT NULL,
        rating        TEXT NOT NULL,
        comment       TEXT,
        visible       INTEGER NOT NULL DEFAULT 0,
        submitted_at  TEXT NOT NULL,
        UNIQUE (task_id, from_agent_id)
    )",
    "CREATE TABLE IF NOT EXISTS court_claims (
        claim_id          TEXT PRIMARY KEY,
        task_id           TEXT NOT NULL UNIQUE REFERENCES board_tasks(task_id),
        claimant_id       TEXT NOT NULL,
        respondent_id     TEXT NOT NULL,
        reason            TEXT NOT NULL,
        status            TEXT NOT NULL,
        rebuttal_deadline TEXT NOT NULL,
        filed_at          TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS court_rebuttals (
        rebuttal_id   TEXT PRIMARY KEY,
        claim_id      TEXT NOT NULL UNIQUE REFERENCES court_claims(claim_id),
        respondent_id TEXT NOT NULL,
        content       TEXT NOT NULL,
        submitted_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS court_rulings (
        ruling_id  TEXT PRIMARY KEY,
        claim_id   TEXT NOT NULL UNIQUE REFERENCES court_claims(claim_id),
        worker_pct INTEGER NOT NULL CHECK (worker_pct BETWEEN 0 AND 100),
        summary    TEXT NOT NULL,
        votes      TEXT NOT NULL,
        ruled_at   TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        event_id   INTEGER PRIMARY KEY AUTOINCREMENT,
        source     TEXT NOT NULL,
        kind       TEXT NOT NULL,
        task_id    TEXT,
        agent_id   TEXT,
        summary    TEXT NOT NULL,
        payload    TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id)",
    "CREATE TABLE IF NOT EXISTS scheduler_locks (
        service      TEXT PRIMARY KEY,
        instance     TEXT NOT NULL,
        heartbeat_at TEXT NOT NULL
    )",
];

/// Handle to the shared database. Cheap to clone; all services hold one.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists. `:memory:` is capped at one connection so every
    /// handle sees the same database.
    pub async fn open(path: &str) -> EconomyResult<Self> {
        let in_memory = path == ":memory:";
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(path, "store opened");

        Ok(Self { pool })
    }

    /// In-memory store for tests and dry runs.
    pub async fn open_in_memory() -> EconomyResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a write transaction. Composites spanning services nest their
    /// statements inside one of these so the ledger never observes a
    /// partial effect.
    pub async fn begin(&self) -> EconomyResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

/// Map a UNIQUE constraint violation onto the conflict class; everything
/// else stays a storage error.
pub(crate) fn map_unique(err: sqlx::Error, message: &str) -> agora_core::EconomyError {
    match &err {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
            agora_core::EconomyError::conflict(message)
        }
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_cleanly() {
        let store = Store::open_in_memory().await.unwrap();
        // Re-running the DDL must be a no-op.
        for statement in SCHEMA {
            sqlx::query(statement).execute(store.pool()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let store = Store::open_in_memory().await.unwrap();
        let orphan = sqlx::query(
            "INSERT INTO bank_accounts (account_id, balance, created_at)
             VALUES ('a-missing', 0, '2026-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await;
        assert!(orphan.is_err());
    }
}
