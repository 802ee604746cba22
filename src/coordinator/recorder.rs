//! # coordinator::recorder — Recording Stage
//!
//! ทุก Position ที่ปิดต้องกลายเป็น Memory Record หนึ่งรายการพอดี
//!
//! - การเขียนแต่ละครั้งรันใน task แยก (`tokio::spawn`): cycle deadline ที่ตัด
//!   pipeline ทิ้งจะไม่ตัดการเขียนกลางทาง (ไม่หาย ไม่ซ้ำ)
//! - Store ล่ม → retry ตาม `store_retry` → หมดแล้วเก็บไว้ใน `unflushed`
//!   + alert ระดับ process + kill switch (ไม่เปิด Position ใหม่จนกว่าจะ rearm)
//! - `unflushed` ถูกลองเขียนซ้ำทุกต้น cycle และตอน drain

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::RunStats;
use crate::config::RetryPolicy;
use crate::error::TradeError;
use crate::events::{EventBus, WsEvent};
use crate::memory::MemoryStore;
use crate::models::{MemoryRecord, Outcome};
use crate::risk::RiskManager;

#[derive(Clone)]
pub struct Recorder {
    memory:    Arc<dyn MemoryStore>,
    risk:      Arc<RiskManager>,
    events:    EventBus,
    stats:     Arc<RunStats>,
    retry:     RetryPolicy,
    unflushed: Arc<Mutex<Vec<MemoryRecord>>>,
}

impl Recorder {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        risk: Arc<RiskManager>,
        events: EventBus,
        stats: Arc<RunStats>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            memory,
            risk,
            events,
            stats,
            retry,
            unflushed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    /// เริ่มเขียน record ใน task แยก: ผู้เรียก await handle เพื่อรอให้เสร็จ
    pub fn spawn(&self, record: MemoryRecord) -> JoinHandle<bool> {
        let recorder = self.clone();
        tokio::spawn(async move { recorder.record(record).await })
    }

    /// true = ลง store แล้ว
    async fn record(&self, record: MemoryRecord) -> bool {
        let symbol = record.symbol.clone();
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.retry.timeout, self.memory.append(record.clone())).await {
                Ok(result) => result,
                Err(_)     => Err(TradeError::StoreUnavailable(format!("append timed out after {:?}", self.retry.timeout))),
            };

            match result {
                Ok(()) => {
                    self.recorded(&record);
                    return true;
                }
                Err(e) if attempt < self.retry.attempts => {
                    warn!(
                        symbol = %symbol,
                        stage  = "recording",
                        kind   = e.kind(),
                        attempt,
                        error  = %e,
                        "🔁 Memory append failed, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.escalate(&symbol, &e).await;
                    self.unflushed.lock().await.push(record);
                    return false;
                }
            }
        }
    }

    fn recorded(&self, record: &MemoryRecord) {
        self.stats.records.fetch_add(1, Ordering::Relaxed);
        match record.outcome {
            Outcome::Success => { self.stats.wins.fetch_add(1, Ordering::Relaxed); }
            Outcome::Failure => { self.stats.losses.fetch_add(1, Ordering::Relaxed); }
            Outcome::Neutral => {}
        }

        info!(
            symbol  = %record.symbol,
            outcome = ?record.outcome,
            pnl_pct = record.pnl_pct,
            reason  = %record.reason,
            "🧠 Memory recorded"
        );
        self.events.publish(&WsEvent::MemoryRecorded {
            symbol:  record.symbol.clone(),
            outcome: format!("{:?}", record.outcome).to_lowercase(),
            pnl_pct: record.pnl_pct,
            lesson:  record.lesson.clone(),
        });
    }

    async fn escalate(&self, symbol: &str, err: &TradeError) {
        self.stats.alerts.fetch_add(1, Ordering::Relaxed);
        error!(
            symbol,
            stage = "recording",
            kind  = err.kind(),
            error = %err,
            "🚨 Memory store unavailable, record held for retry, opens halted"
        );
        self.events.publish(&WsEvent::Alert {
            symbol:  Some(symbol.to_string()),
            kind:    err.kind().to_string(),
            message: err.to_string(),
        });

        let reason = format!("memory store unavailable: {err}");
        if !self.risk.is_killed().await {
            self.risk.kill(&reason).await;
            self.events.publish(&WsEvent::RiskKilled { reason });
        }
    }

    /// ลองเขียน record ที่ค้างอยู่ตามลำดับเดิม: คืนจำนวนที่ยังค้าง
    pub async fn flush_unflushed(&self) -> usize {
        let mut unflushed = self.unflushed.lock().await;
        if unflushed.is_empty() {
            return 0;
        }

        let mut written = 0;
        for record in unflushed.iter() {
            match self.memory.append(record.clone()).await {
                Ok(()) => {
                    self.recorded(record);
                    written += 1;
                }
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, pending = unflushed.len() - written, "⚠️ Held memory records still unwritten");
                    break;
                }
            }
        }
        unflushed.drain(..written);
        unflushed.len()
    }

    pub async fn unflushed_len(&self) -> usize {
        self.unflushed.lock().await.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FlakyStore;
    use super::*;
    use crate::models::{ClosedPosition, CloseReason, MarketRegime, Position, PositionSide, StrategyLabel};
    use crate::risk::RiskConfig;
    use std::time::Duration;

    fn record() -> MemoryRecord {
        let pos = Position {
            side:        PositionSide::Long,
            entry_price: 100.0,
            size:        1.0,
            strategy:    StrategyLabel::Balanced,
            ..Position::flat("SOL/USDT")
        };
        let closed = ClosedPosition::new(pos, 103.0, CloseReason::TakeProfit);
        MemoryRecord::from_close(&closed, MarketRegime::TrendingUp, 0.1)
    }

    fn recorder(store: Arc<dyn MemoryStore>, risk: Arc<RiskManager>) -> Recorder {
        Recorder::new(
            store,
            risk,
            EventBus::new(),
            Arc::new(RunStats::default()),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_record_lands_in_store() {
        let store = Arc::new(crate::memory::JournalStore::in_memory());
        let recorder = recorder(store.clone(), Arc::new(RiskManager::new(RiskConfig::default())));

        assert!(recorder.spawn(record()).await.unwrap());
        assert_eq!(store.len().await, 1);
        assert_eq!(recorder.stats.wins.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_store_outage_holds_record_and_kills() {
        let store = Arc::new(FlakyStore::down());
        let risk  = Arc::new(RiskManager::new(RiskConfig::default()));
        let recorder = recorder(store.clone(), risk.clone());

        assert!(!recorder.spawn(record()).await.unwrap());
        assert_eq!(store.appends.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.unflushed_len().await, 1);
        assert!(risk.is_killed().await);

        // store กลับมา → flush ได้ และไม่ซ้ำ
        store.down.store(false, Ordering::SeqCst);
        assert_eq!(recorder.flush_unflushed().await, 0);
        assert_eq!(store.inner.len().await, 1);
        assert_eq!(recorder.flush_unflushed().await, 0);
        assert_eq!(store.inner.len().await, 1);
    }
}
