//! # memory::journal
//!
//! Memory Store แบบ JSON-lines (หนึ่ง record ต่อหนึ่งบรรทัด)
//!
//! ## Durability
//! - append: เขียนบรรทัดเต็ม → `flush` → `sync_data` แล้วค่อยให้ reader เห็น
//! - เขียนไม่ครบ → truncate กลับไปความยาวเดิม (ไม่มี partial record ค้าง)
//! - ตอนโหลด บรรทัดที่ parse ไม่ได้ (เช่น torn line จาก crash) ถูกข้าม
//!
//! ## Concurrency
//! - `file` mutex serialize การ append
//! - `records` เป็น `Arc<Vec<_>>`: query clone Arc ออกไปเป็น snapshot
//!   ส่วน append ใช้ `Arc::make_mut` (copy-on-write เมื่อมี cursor ถืออยู่)
//! - Insight cache ต่อ (symbol, strategy) ถูกล้างทุกครั้งที่ append symbol นั้น

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{MemoryStore, RecordCursor};
use crate::error::TradeError;
use crate::models::{Insight, MemoryQuery, MemoryRecord, StrategyLabel};

type InsightKey = (String, Option<StrategyLabel>);

pub struct JournalStore {
    path:     Option<PathBuf>,
    file:     Mutex<Option<File>>,
    records:  RwLock<Arc<Vec<MemoryRecord>>>,
    insights: RwLock<HashMap<InsightKey, Insight>>,
}

impl JournalStore {
    /// เปิด (หรือสร้าง) journal ที่ `path` แล้วโหลด records เดิมทั้งหมด
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TradeError> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| store_err("create journal directory", e))?;
        }

        let (records, ends_clean) = load_records(&path).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| store_err("open journal", e))?;

        // ปิดท้าย torn line ไม่ให้ record ถัดไปต่อท้ายบรรทัดเสีย
        if !ends_clean {
            file.write_all(b"\n")
                .await
                .map_err(|e| store_err("repair journal", e))?;
        }

        info!(path = %path.display(), records = records.len(), "🧠 Memory journal loaded");

        Ok(Self {
            path:     Some(path),
            file:     Mutex::new(Some(file)),
            records:  RwLock::new(Arc::new(records)),
            insights: RwLock::new(HashMap::new()),
        })
    }

    /// Store ที่ไม่มีไฟล์: สำหรับ test และ dry run
    pub fn in_memory() -> Self {
        Self {
            path:     None,
            file:     Mutex::new(None),
            records:  RwLock::new(Arc::new(Vec::new())),
            insights: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl MemoryStore for JournalStore {
    fn backend(&self) -> &'static str {
        if self.path.is_some() { "journal" } else { "in-memory" }
    }

    async fn append(&self, record: MemoryRecord) -> Result<(), TradeError> {
        let mut line = serde_json::to_string(&record)
            .map_err(|e| TradeError::StoreUnavailable(format!("encode record: {e}")))?;
        line.push('\n');

        let mut file = self.file.lock().await;

        if let Some(file) = file.as_mut() {
            let len_before = file
                .metadata()
                .await
                .map_err(|e| store_err("stat journal", e))?
                .len();

            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.flush().await?;
                file.sync_data().await
            }
            .await;

            if let Err(e) = written {
                if let Err(trunc) = file.set_len(len_before).await {
                    warn!(error = %trunc, "⚠️ Could not roll back partial journal write");
                }
                return Err(store_err("write journal", e));
            }
        }

        {
            let mut records = self.records.write().await;
            Arc::make_mut(&mut records).push(record.clone());
        }
        self.insights
            .write()
            .await
            .retain(|(symbol, _), _| symbol != &record.symbol);

        debug!(symbol = %record.symbol, outcome = ?record.outcome, "🧠 Memory record appended");
        Ok(())
    }

    async fn query(&self, query: MemoryQuery) -> Result<RecordCursor, TradeError> {
        let snapshot = Arc::clone(&*self.records.read().await);
        Ok(RecordCursor::new(snapshot, query))
    }

    async fn summarize(
        &self,
        symbol: &str,
        strategy: Option<StrategyLabel>,
    ) -> Result<Insight, TradeError> {
        let key = (symbol.to_string(), strategy);
        if let Some(hit) = self.insights.read().await.get(&key) {
            return Ok(hit.clone());
        }

        // ถือ read lock ของ records ไว้ระหว่างเติม cache: append ที่แทรกเข้ามา
        // จะ invalidate หลังจากนี้เสมอ
        let records = self.records.read().await;
        let cursor  = RecordCursor::new(Arc::clone(&*records), MemoryQuery::symbol(symbol).strategy(strategy));
        let insight = Insight::from_records(symbol, strategy, cursor);
        self.insights.write().await.insert(key, insight.clone());
        drop(records);

        Ok(insight)
    }

    async fn flush(&self) -> Result<(), TradeError> {
        let mut file = self.file.lock().await;
        if let Some(file) = file.as_mut() {
            file.flush().await.map_err(|e| store_err("flush journal", e))?;
            file.sync_all().await.map_err(|e| store_err("sync journal", e))?;
        }
        Ok(())
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn store_err(action: &str, err: std::io::Error) -> TradeError {
    TradeError::StoreUnavailable(format!("{action}: {err}"))
}

/// โหลด records ทั้งหมด: คืน `true` ถ้าไฟล์จบด้วย newline (หรือว่าง)
async fn load_records(path: &Path) -> Result<(Vec<MemoryRecord>, bool), TradeError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), true)),
        Err(e) => return Err(store_err("read journal", e)),
    };
    let ends_clean = bytes.last().map_or(true, |b| *b == b'\n');

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in String::from_utf8_lossy(&bytes).lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryRecord>(line) {
            Ok(record) => records.push(record),
            Err(_)     => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "⚠️ Skipped unreadable journal lines");
    }
    Ok((records, ends_clean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, MarketRegime, Outcome, PositionSide};
    use chrono::Utc;
    use uuid::Uuid;

    fn record(symbol: &str, pnl: f64) -> MemoryRecord {
        MemoryRecord {
            record_id:   Uuid::new_v4(),
            symbol:      symbol.into(),
            strategy:    StrategyLabel::Balanced,
            side:        PositionSide::Long,
            outcome:     Outcome::classify(pnl, 0.1),
            pnl_pct:     pnl,
            entry_price: 100.0,
            exit_price:  100.0 + pnl,
            regime:      MarketRegime::TrendingDown,
            reason:      CloseReason::StopLoss,
            lesson:      format!("lesson {pnl}"),
            opened_at:   None,
            recorded_at: Utc::now(),
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("hindsight-test-{}", Uuid::new_v4()))
            .join("memory.jsonl")
    }

    #[tokio::test]
    async fn test_insight_reflects_just_inserted_record() {
        let store = JournalStore::in_memory();
        store.append(record("BTC/USDT", 2.0)).await.unwrap();

        let before = store.summarize("BTC/USDT", None).await.unwrap();
        assert_eq!(before.count, 1);

        store.append(record("BTC/USDT", -1.5)).await.unwrap();
        let after = store.summarize("BTC/USDT", None).await.unwrap();
        assert_eq!(after.count, 2);
        assert_eq!(after.losses, 1);
        assert_eq!(after.last_failure_lesson.as_deref(), Some("lesson -1.5"));
    }

    #[tokio::test]
    async fn test_cache_only_invalidated_for_same_symbol() {
        let store = JournalStore::in_memory();
        store.append(record("ETH/USDT", 1.0)).await.unwrap();
        let eth = store.summarize("ETH/USDT", None).await.unwrap();

        store.append(record("BTC/USDT", 1.0)).await.unwrap();
        assert!(store.insights.read().await.contains_key(&("ETH/USDT".to_string(), None)));
        assert_eq!(store.summarize("ETH/USDT", None).await.unwrap(), eth);
    }

    #[tokio::test]
    async fn test_cursor_is_stable_snapshot() {
        let store = JournalStore::in_memory();
        store.append(record("BTC/USDT", 1.0)).await.unwrap();
        let cursor = store.query(MemoryQuery::symbol("BTC/USDT")).await.unwrap();

        store.append(record("BTC/USDT", 2.0)).await.unwrap();
        assert_eq!(cursor.count(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let path = temp_path();
        {
            let store = JournalStore::open(&path).await.unwrap();
            store.append(record("BTC/USDT", 1.0)).await.unwrap();
            store.append(record("BTC/USDT", -2.0)).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = JournalStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        let newest = store
            .query(MemoryQuery::symbol("BTC/USDT").limit(1))
            .await
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(newest.pnl_pct, -2.0);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_skipped() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = serde_json::to_string(&record("BTC/USDT", 1.0)).unwrap();
        std::fs::write(&path, format!("{good}\n{{\"record_id\":\"abc\",\"sym")).unwrap();

        let store = JournalStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);

        store.append(record("BTC/USDT", 2.0)).await.unwrap();
        drop(store);
        let reopened = JournalStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
