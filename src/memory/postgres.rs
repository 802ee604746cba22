//! # memory::postgres
//!
//! Memory Store บน PostgreSQL (`--features postgres`)
//!
//! ตาราง `memory_records` ถูกสร้างตอน connect ถ้ายังไม่มี
//! enum ทุกตัวเก็บเป็น text (serde name): P&L เก็บเป็น DOUBLE PRECISION
//! Insight fold ฝั่ง Rust ผ่าน default `summarize` ของ trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{MemoryStore, RecordCursor};
use crate::error::TradeError;
use crate::models::{MemoryQuery, MemoryRecord};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS memory_records (
    record_id    UUID PRIMARY KEY,
    symbol       TEXT NOT NULL,
    strategy     TEXT NOT NULL,
    side         TEXT NOT NULL,
    outcome      TEXT NOT NULL,
    pnl_pct      DOUBLE PRECISION NOT NULL,
    entry_price  DOUBLE PRECISION NOT NULL,
    exit_price   DOUBLE PRECISION NOT NULL,
    regime       TEXT NOT NULL,
    reason       TEXT NOT NULL,
    lesson       TEXT NOT NULL,
    opened_at    TIMESTAMPTZ,
    recorded_at  TIMESTAMPTZ NOT NULL
)"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS memory_records_symbol_time ON memory_records (symbol, recorded_at DESC)";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, TradeError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        sqlx::query(CREATE_TABLE).execute(&pool).await.map_err(db_err)?;
        sqlx::query(CREATE_INDEX).execute(&pool).await.map_err(db_err)?;

        info!("🐘 PostgreSQL memory store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl MemoryStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn append(&self, record: MemoryRecord) -> Result<(), TradeError> {
        sqlx::query(
            "INSERT INTO memory_records \
             (record_id, symbol, strategy, side, outcome, pnl_pct, entry_price, exit_price, \
              regime, reason, lesson, opened_at, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(record.record_id)
        .bind(&record.symbol)
        .bind(record.strategy.as_str())
        .bind(record.side.to_string())
        .bind(encode(&record.outcome)?)
        .bind(record.pnl_pct)
        .bind(record.entry_price)
        .bind(record.exit_price)
        .bind(record.regime.as_str())
        .bind(record.reason.as_str())
        .bind(&record.lesson)
        .bind(record.opened_at)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn query(&self, query: MemoryQuery) -> Result<RecordCursor, TradeError> {
        let rows = sqlx::query(
            "SELECT * FROM memory_records \
             WHERE symbol = $1 \
               AND ($2::TEXT IS NULL OR strategy = $2) \
               AND ($3::TIMESTAMPTZ IS NULL OR recorded_at >= $3) \
             ORDER BY recorded_at DESC \
             LIMIT $4",
        )
        .bind(&query.symbol)
        .bind(query.strategy.map(|s| s.as_str()))
        .bind(query.since)
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RecordCursor::from_newest_first(records, query))
    }
}

// ─── Row Mapping ──────────────────────────────────────────────────────────────

fn row_to_record(row: &PgRow) -> Result<MemoryRecord, TradeError> {
    Ok(MemoryRecord {
        record_id:   row.try_get::<Uuid, _>("record_id").map_err(db_err)?,
        symbol:      row.try_get("symbol").map_err(db_err)?,
        strategy:    decode(row.try_get("strategy").map_err(db_err)?)?,
        side:        decode(row.try_get("side").map_err(db_err)?)?,
        outcome:     decode(row.try_get("outcome").map_err(db_err)?)?,
        pnl_pct:     row.try_get("pnl_pct").map_err(db_err)?,
        entry_price: row.try_get("entry_price").map_err(db_err)?,
        exit_price:  row.try_get("exit_price").map_err(db_err)?,
        regime:      decode(row.try_get("regime").map_err(db_err)?)?,
        reason:      decode(row.try_get("reason").map_err(db_err)?)?,
        lesson:      row.try_get("lesson").map_err(db_err)?,
        opened_at:   row.try_get::<Option<DateTime<Utc>>, _>("opened_at").map_err(db_err)?,
        recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at").map_err(db_err)?,
    })
}

/// serde name ของ enum (เช่น `"success"`)
fn encode<T: serde::Serialize>(value: &T) -> Result<String, TradeError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(TradeError::StoreUnavailable(format!("non-string enum value {other}"))),
        Err(e)    => Err(TradeError::StoreUnavailable(e.to_string())),
    }
}

fn decode<T: DeserializeOwned>(text: String) -> Result<T, TradeError> {
    serde_json::from_value(serde_json::Value::String(text))
        .map_err(|e| TradeError::StoreUnavailable(format!("corrupt memory row: {e}")))
}

fn db_err(err: sqlx::Error) -> TradeError {
    TradeError::StoreUnavailable(err.to_string())
}
