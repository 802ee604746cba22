//! # memory — Memory Store
//!
//! ที่เก็บผลการเทรดในอดีต (append-only) + Insight ที่ derive จากมัน
//!
//! ## Contract
//! - `append` เป็น atomic: record ถูกเขียนครบทั้งก้อนหรือไม่ถูกเขียนเลย
//! - `query` คืน [`RecordCursor`] ที่อ่าน snapshot คงที่ ณ ตอน query
//!   (append ที่ตามมาไม่ทำให้ cursor ที่ถืออยู่เปลี่ยน)
//! - append ถูก serialize ภายใน, read ทำพร้อมกันได้
//!
//! ## Backends
//! - [`journal::JournalStore`]  : JSON-lines file (default) หรือ in-memory
//! - [`postgres::PostgresStore`]: PostgreSQL (cargo feature `postgres`)

pub mod journal;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TradeError;
use crate::models::{Insight, MemoryQuery, MemoryRecord, StrategyLabel};

pub use journal::JournalStore;

// ─── Store Trait ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// ชื่อ backend สำหรับ log / stats
    fn backend(&self) -> &'static str;

    async fn append(&self, record: MemoryRecord) -> Result<(), TradeError>;

    /// Records ที่ตรง query เรียงใหม่สุดก่อน: ว่างได้ ไม่ใช่ error
    async fn query(&self, query: MemoryQuery) -> Result<RecordCursor, TradeError>;

    async fn summarize(
        &self,
        symbol: &str,
        strategy: Option<StrategyLabel>,
    ) -> Result<Insight, TradeError> {
        let cursor = self.query(MemoryQuery::symbol(symbol).strategy(strategy)).await?;
        Ok(Insight::from_records(symbol, strategy, cursor))
    }

    /// บังคับให้ทุกอย่างที่ append ไปแล้วลง medium (เรียกตอน drain)
    async fn flush(&self) -> Result<(), TradeError> {
        Ok(())
    }
}

// ─── Cursor ───────────────────────────────────────────────────────────────────

/// Lazy, restartable iterator over a fixed snapshot of records.
///
/// `records` are held oldest-first (append order); iteration walks backwards
/// so callers see newest-first. Filtering happens during iteration.
#[derive(Debug, Clone)]
pub struct RecordCursor {
    records: Arc<Vec<MemoryRecord>>,
    query:   MemoryQuery,
    /// จำนวน record จากท้ายที่เดินผ่านแล้ว
    scanned: usize,
    yielded: usize,
}

impl RecordCursor {
    pub fn new(records: Arc<Vec<MemoryRecord>>, query: MemoryQuery) -> Self {
        Self { records, query, scanned: 0, yielded: 0 }
    }

    /// Cursor ที่ records ผ่านการกรองมาแล้ว (backend ที่ query ฝั่ง server)
    /// รับมาแบบใหม่สุดก่อน
    pub fn from_newest_first(mut records: Vec<MemoryRecord>, query: MemoryQuery) -> Self {
        records.reverse();
        Self::new(Arc::new(records), query)
    }

    /// เริ่มเดินใหม่จากตัวใหม่สุด บน snapshot เดิม
    pub fn restart(&mut self) {
        self.scanned = 0;
        self.yielded = 0;
    }
}

impl Iterator for RecordCursor {
    type Item = MemoryRecord;

    fn next(&mut self) -> Option<MemoryRecord> {
        if self.query.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        while self.scanned < self.records.len() {
            let index = self.records.len() - 1 - self.scanned;
            self.scanned += 1;
            let record = &self.records[index];
            if self.query.matches(record) {
                self.yielded += 1;
                return Some(record.clone());
            }
        }
        None
    }
}
