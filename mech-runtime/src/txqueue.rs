//! Transaction Queue: a durable, at-most-once queue of on-chain
//! transactions backed by an embedded SQLite database in WAL mode.
//!
//! `claim` is one atomic `UPDATE ... RETURNING`-style transaction so that
//! multiple workers sharing the same queue file never both win the same
//! row within the claim-timeout window.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::types::{ExecutionStrategy, TxRequest, TxStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tx_requests (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('PENDING','CLAIMED','CONFIRMED','FAILED')),
    attempt_count INTEGER NOT NULL DEFAULT 0,
    payload_hash TEXT NOT NULL UNIQUE,
    worker_id TEXT,
    claimed_at TEXT,
    completed_at TEXT,
    chain_id INTEGER NOT NULL,
    execution_strategy TEXT NOT NULL,
    payload TEXT NOT NULL,
    safe_tx_hash TEXT,
    tx_hash TEXT,
    error_code TEXT,
    error_message TEXT,
    idempotency_key TEXT UNIQUE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tx_requests_status_created
    ON tx_requests (status, created_at);
"#;

pub struct EnqueueInput {
    pub chain_id: u64,
    pub execution_strategy: ExecutionStrategy,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
pub struct StatusUpdate {
    pub safe_tx_hash: Option<B256>,
    pub tx_hash: Option<B256>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Serialize)]
pub struct TxQueueMetrics {
    pub pending: i64,
    pub claimed: i64,
    pub confirmed: i64,
    pub failed: i64,
}

pub struct TxQueue {
    pool: SqlitePool,
}

impl TxQueue {
    pub async fn connect(db_path: &str) -> Result<Self, WorkerError> {
        let url = format!("sqlite://{db_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=30000").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Canonical SHA-256 of the payload's sorted-key JSON serialization.
    /// `serde_json::Value`'s default `Map` is key-sorted (no `preserve_order`
    /// feature enabled), so two payloads differing only in key order hash
    /// identically.
    pub fn payload_hash(payload: &serde_json::Value) -> Result<String, WorkerError> {
        let canonical = serde_json::to_vec(payload)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Insert a new row, or return the existing one if `payloadHash` already
    /// exists (idempotent enqueue).
    pub async fn enqueue(&self, input: EnqueueInput) -> Result<TxRequest, WorkerError> {
        let payload_hash = Self::payload_hash(&input.payload)?;

        if let Some(existing) = self.get_by_payload_hash(&payload_hash).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload_json = serde_json::to_string(&input.payload)?;

        let result = sqlx::query(
            r#"INSERT INTO tx_requests
                (id, status, attempt_count, payload_hash, chain_id, execution_strategy,
                 payload, idempotency_key, created_at, updated_at)
               VALUES (?1, 'PENDING', 0, ?2, ?3, ?4, ?5, ?6, ?7, ?7)"#,
        )
        .bind(id.to_string())
        .bind(&payload_hash)
        .bind(input.chain_id as i64)
        .bind(execution_strategy_str(input.execution_strategy))
        .bind(&payload_json)
        .bind(&input.idempotency_key)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self
                .get_status(id)
                .await?
                .ok_or_else(|| WorkerError::QueueError("row vanished after insert".to_string())),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // Raced with a concurrent enqueue of the same payload.
                self.get_by_payload_hash(&payload_hash)
                    .await?
                    .ok_or_else(|| WorkerError::QueueError("unique violation but no row found".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the oldest PENDING row, or the oldest CLAIMED row
    /// whose lease has expired.
    pub async fn claim(&self, worker_id: &str, claim_timeout_ms: i64) -> Result<Option<TxRequest>, WorkerError> {
        let mut tx = self.pool.begin().await?;

        let expiry_cutoff = (Utc::now() - chrono::Duration::milliseconds(claim_timeout_ms)).to_rfc3339();

        let row = sqlx::query(
            r#"SELECT id FROM tx_requests
               WHERE status = 'PENDING'
                  OR (status = 'CLAIMED' AND claimed_at < ?1)
               ORDER BY created_at ASC
               LIMIT 1"#,
        )
        .bind(&expiry_cutoff)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: String = row.get("id");
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"UPDATE tx_requests
               SET status = 'CLAIMED', worker_id = ?1, claimed_at = ?2,
                   attempt_count = attempt_count + 1, updated_at = ?2
               WHERE id = ?3"#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_status(Uuid::from_str(&id).map_err(|e| WorkerError::QueueError(e.to_string()))?)
            .await
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        status: TxStatus,
        metadata: StatusUpdate,
    ) -> Result<(), WorkerError> {
        let now = Utc::now();
        let completed_at = if metadata.completed {
            Some(now.to_rfc3339())
        } else {
            None
        };

        sqlx::query(
            r#"UPDATE tx_requests
               SET status = ?1,
                   safe_tx_hash = COALESCE(?2, safe_tx_hash),
                   tx_hash = COALESCE(?3, tx_hash),
                   error_code = COALESCE(?4, error_code),
                   error_message = COALESCE(?5, error_message),
                   completed_at = COALESCE(?6, completed_at),
                   updated_at = ?7
               WHERE id = ?8"#,
        )
        .bind(status.as_str())
        .bind(metadata.safe_tx_hash.map(|h| h.to_string()))
        .bind(metadata.tx_hash.map(|h| h.to_string()))
        .bind(&metadata.error_code)
        .bind(&metadata.error_message)
        .bind(completed_at)
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Option<TxRequest>, WorkerError> {
        let row = sqlx::query("SELECT * FROM tx_requests WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_tx_request).transpose()
    }

    pub async fn get_by_payload_hash(&self, hash: &str) -> Result<Option<TxRequest>, WorkerError> {
        let row = sqlx::query("SELECT * FROM tx_requests WHERE payload_hash = ?1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_tx_request).transpose()
    }

    pub async fn get_pending(&self, limit: i64) -> Result<Vec<TxRequest>, WorkerError> {
        let rows = sqlx::query(
            "SELECT * FROM tx_requests WHERE status = 'PENDING' ORDER BY created_at ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_tx_request).collect()
    }

    pub async fn get_expired_claims(&self, timeout_ms: i64) -> Result<Vec<TxRequest>, WorkerError> {
        let cutoff = (Utc::now() - chrono::Duration::milliseconds(timeout_ms)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM tx_requests WHERE status = 'CLAIMED' AND claimed_at < ?1 ORDER BY created_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_tx_request).collect()
    }

    /// Delete CONFIRMED/FAILED rows older than `older_than_ms`. Returns the
    /// number of rows removed.
    pub async fn cleanup(&self, older_than_ms: i64) -> Result<u64, WorkerError> {
        let cutoff = (Utc::now() - chrono::Duration::milliseconds(older_than_ms)).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM tx_requests WHERE status IN ('CONFIRMED','FAILED') AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_metrics(&self) -> Result<TxQueueMetrics, WorkerError> {
        let row = sqlx::query(
            r#"SELECT
                 SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END) AS pending,
                 SUM(CASE WHEN status = 'CLAIMED' THEN 1 ELSE 0 END) AS claimed,
                 SUM(CASE WHEN status = 'CONFIRMED' THEN 1 ELSE 0 END) AS confirmed,
                 SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END) AS failed
               FROM tx_requests"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TxQueueMetrics {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            claimed: row.try_get::<Option<i64>, _>("claimed")?.unwrap_or(0),
            confirmed: row.try_get::<Option<i64>, _>("confirmed")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        })
    }
}

fn execution_strategy_str(strategy: ExecutionStrategy) -> &'static str {
    match strategy {
        ExecutionStrategy::Eoa => "EOA",
        ExecutionStrategy::Safe => "SAFE",
    }
}

fn row_to_tx_request(row: SqliteRow) -> Result<TxRequest, WorkerError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let execution_strategy: String = row.try_get("execution_strategy")?;
    let payload: String = row.try_get("payload")?;
    let claimed_at: Option<String> = row.try_get("claimed_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let safe_tx_hash: Option<String> = row.try_get("safe_tx_hash")?;
    let tx_hash: Option<String> = row.try_get("tx_hash")?;

    Ok(TxRequest {
        id: Uuid::from_str(&id).map_err(|e| WorkerError::QueueError(e.to_string()))?,
        status: TxStatus::from_str(&status).map_err(WorkerError::QueueError)?,
        attempt_count: row.try_get("attempt_count")?,
        payload_hash: row.try_get("payload_hash")?,
        worker_id: row.try_get("worker_id")?,
        claimed_at: claimed_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| WorkerError::QueueError(e.to_string()))?,
        completed_at: completed_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| WorkerError::QueueError(e.to_string()))?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        execution_strategy: ExecutionStrategy::from_str(&execution_strategy)
            .map_err(WorkerError::QueueError)?,
        payload: serde_json::from_str(&payload)?,
        safe_tx_hash: safe_tx_hash
            .map(|s| s.parse::<B256>())
            .transpose()
            .map_err(|e| WorkerError::QueueError(e.to_string()))?,
        tx_hash: tx_hash
            .map(|s| s.parse::<B256>())
            .transpose()
            .map_err(|e| WorkerError::QueueError(e.to_string()))?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| WorkerError::QueueError(e.to_string()))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| WorkerError::QueueError(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_queue() -> TxQueue {
        TxQueue::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_on_canonical_payload() {
        let queue = test_queue().await;
        let payload = json!({"to": "0xabc", "value": 0, "data": "0x1234"});

        let first = queue
            .enqueue(EnqueueInput {
                chain_id: 8453,
                execution_strategy: ExecutionStrategy::Safe,
                payload: payload.clone(),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let second = queue
            .enqueue(EnqueueInput {
                chain_id: 8453,
                execution_strategy: ExecutionStrategy::Safe,
                payload,
                idempotency_key: None,
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn payload_hash_is_stable_across_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(TxQueue::payload_hash(&a).unwrap(), TxQueue::payload_hash(&b).unwrap());
    }

    #[tokio::test]
    async fn claim_is_exclusive_within_the_lease_window() {
        let queue = test_queue().await;
        queue
            .enqueue(EnqueueInput {
                chain_id: 1,
                execution_strategy: ExecutionStrategy::Eoa,
                payload: json!({"x": 1}),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let first = queue.claim("worker-a", 60_000).await.unwrap();
        assert!(first.is_some());

        let second = queue.claim("worker-b", 60_000).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimable() {
        let queue = test_queue().await;
        queue
            .enqueue(EnqueueInput {
                chain_id: 1,
                execution_strategy: ExecutionStrategy::Eoa,
                payload: json!({"x": 2}),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let first = queue.claim("worker-a", 0).await.unwrap().unwrap();
        assert_eq!(first.attempt_count, 1);

        // Claim timeout of 0ms means the row is immediately re-claimable.
        let second = queue.claim("worker-b", 0).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 2);
    }
}
