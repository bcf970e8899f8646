//! Postgres event store
//!
//! Records live in `relay_records`, one row per dedup key. A compare-and-swap
//! locks the row (`SELECT ... FOR UPDATE`), checks it against the expected
//! state in Rust and writes in the same transaction, so writes on one key are
//! serialized while reads stay concurrent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::error;

use super::{validate_update, CreateOutcome, EventStore};
use crate::error::{RelayError, RelayResult};
use crate::types::{ChainCheckpoint, DedupKey, LockPayload, RelayRecord, RelayState, SourceEvent};

const RECORD_COLUMNS: &str = r#"
    dedup_key, source_chain_id, contract_address, block_hash, block_number, tx_hash,
    log_index, beneficiary, amount, asset_id, metadata, state, destination_tx_hash,
    attempt_count, last_error, next_retry_at, frozen, created_at, updated_at
"#;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> eyre::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> eyre::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct RelayRow {
    dedup_key: String,
    source_chain_id: String,
    contract_address: String,
    block_hash: String,
    block_number: i64,
    tx_hash: String,
    log_index: i64,
    beneficiary: String,
    amount: String,
    asset_id: String,
    metadata: String,
    state: String,
    destination_tx_hash: Option<String>,
    attempt_count: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    frozen: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RelayRow {
    fn into_record(self) -> RelayResult<RelayRecord> {
        let key = DedupKey::from_raw(self.dedup_key);
        let state = self
            .state
            .parse::<RelayState>()
            .map_err(|reason| RelayError::StoreCorruption {
                key: key.clone(),
                reason,
            })?;
        let metadata =
            serde_json::from_str(&self.metadata).map_err(|e| RelayError::StoreCorruption {
                key: key.clone(),
                reason: format!("unreadable metadata: {}", e),
            })?;

        Ok(RelayRecord {
            dedup_key: key,
            event: SourceEvent {
                source_chain_id: self.source_chain_id,
                contract_address: self.contract_address,
                block_hash: self.block_hash,
                block_number: self.block_number as u64,
                tx_hash: self.tx_hash,
                log_index: self.log_index as u64,
                payload: LockPayload {
                    beneficiary: self.beneficiary,
                    amount: self.amount,
                    asset_id: self.asset_id,
                    metadata,
                },
            },
            state,
            destination_tx_hash: self.destination_tx_hash,
            attempt_count: self.attempt_count as u32,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at,
            frozen: self.frozen,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Event store backed by Postgres
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_if_absent(&self, record: &RelayRecord) -> RelayResult<CreateOutcome> {
        let event = &record.event;
        let metadata = serde_json::to_string(&event.payload.metadata)
            .map_err(|e| RelayError::Store(format!("metadata encode: {}", e)))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO relay_records (dedup_key, source_chain_id, contract_address, block_hash,
                block_number, tx_hash, log_index, beneficiary, amount, asset_id, metadata, state,
                destination_tx_hash, attempt_count, last_error, next_retry_at, frozen,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(record.dedup_key.as_str())
        .bind(&event.source_chain_id)
        .bind(&event.contract_address)
        .bind(&event.block_hash)
        .bind(event.block_number as i64)
        .bind(&event.tx_hash)
        .bind(event.log_index as i64)
        .bind(&event.payload.beneficiary)
        .bind(&event.payload.amount)
        .bind(&event.payload.asset_id)
        .bind(metadata)
        .bind(record.state.as_str())
        .bind(&record.destination_tx_hash)
        .bind(record.attempt_count as i32)
        .bind(&record.last_error)
        .bind(record.next_retry_at)
        .bind(record.frozen)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(CreateOutcome::Created);
        }

        match self.get(&record.dedup_key).await? {
            Some(existing) => Ok(CreateOutcome::AlreadyPresent(Box::new(existing))),
            None => Err(RelayError::Store(format!(
                "insert of {} reported a conflict but no row exists",
                record.dedup_key
            ))),
        }
    }

    async fn get(&self, key: &DedupKey) -> RelayResult<Option<RelayRecord>> {
        let row = sqlx::query_as::<_, RelayRow>(&format!(
            "SELECT {} FROM relay_records WHERE dedup_key = $1",
            RECORD_COLUMNS
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RelayRow::into_record).transpose()
    }

    async fn compare_and_swap(
        &self,
        expected: RelayState,
        record: &RelayRecord,
    ) -> RelayResult<()> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, RelayRow>(&format!(
            "SELECT {} FROM relay_records WHERE dedup_key = $1 FOR UPDATE",
            RECORD_COLUMNS
        ))
        .bind(record.dedup_key.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(RelayRow::into_record)
        .transpose()?
        .ok_or_else(|| RelayError::conflict(&record.dedup_key, expected, None))?;

        validate_update(&current, expected, record)?;

        sqlx::query(
            r#"
            UPDATE relay_records
            SET state = $2, destination_tx_hash = $3, attempt_count = $4, last_error = $5,
                next_retry_at = $6, updated_at = NOW()
            WHERE dedup_key = $1
            "#,
        )
        .bind(record.dedup_key.as_str())
        .bind(record.state.as_str())
        .bind(&record.destination_tx_hash)
        .bind(record.attempt_count as i32)
        .bind(&record.last_error)
        .bind(record.next_retry_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn scan_by_state(&self, states: &[RelayState]) -> RelayResult<Vec<RelayRecord>> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, RelayRow>(&format!(
            "SELECT {} FROM relay_records WHERE state = ANY($1) ORDER BY created_at, block_number, log_index",
            RECORD_COLUMNS
        ))
        .bind(states)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error scanning relay records: {:?}", e);
            e
        })?;

        rows.into_iter().map(RelayRow::into_record).collect()
    }

    async fn freeze(&self, key: &DedupKey, reason: &str) -> RelayResult<()> {
        sqlx::query(
            r#"UPDATE relay_records SET frozen = TRUE, last_error = $2, updated_at = NOW() WHERE dedup_key = $1"#,
        )
        .bind(key.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scan_frozen(&self) -> RelayResult<Vec<RelayRecord>> {
        let rows = sqlx::query_as::<_, RelayRow>(&format!(
            "SELECT {} FROM relay_records WHERE frozen ORDER BY created_at",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RelayRow::into_record).collect()
    }

    async fn checkpoint(&self, chain_id: &str) -> RelayResult<Option<ChainCheckpoint>> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"SELECT height FROM chain_checkpoints WHERE chain_id = $1"#,
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ChainCheckpoint { height: r.0 as u64 }))
    }

    async fn advance_checkpoint(
        &self,
        chain_id: &str,
        height: u64,
    ) -> RelayResult<ChainCheckpoint> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO chain_checkpoints (chain_id, height, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id) DO UPDATE
            SET height = GREATEST(chain_checkpoints.height, EXCLUDED.height), updated_at = NOW()
            RETURNING height
            "#,
        )
        .bind(chain_id)
        .bind(height as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(ChainCheckpoint { height: row.0 as u64 })
    }
}
