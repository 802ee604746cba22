//! # coordinator — Execution Coordinator
//!
//! Orchestrator ต่อ cycle ต่อ symbol:
//!
//! ```text
//!  Idle ─▶ Snapshotting ─▶ Reconciling ─▶ Advising ─▶ Ordering ─▶ Settling ─▶ Recording ─▶ Idle
//!   │            │               │             │
//!   │ pending    │ snapshot      │ conflict    │ hold / invalid / unavailable
//!   ▼ ยังไม่จบ    ▼ ล่ม            ▼             ▼
//!  skip        skip            skip          Idle
//! ```
//!
//! - symbol ต่างกันรันพร้อมกัน (`join_all`) แต่ละ symbol เดินทีละ stage
//! - slot ของ symbol ถูกล็อคตลอด pipeline: cycle ใหม่ที่เจอ slot ไม่ว่างจะข้าม
//! - pipeline ทั้งก้อนอยู่ใต้ `cycle_deadline`; intent ที่ส่งไปแล้วไม่ถูก cancel
//!   แต่ resolve จาก exchange state ในรอบถัดไป

pub mod gates;
pub mod pipeline;
pub mod planner;
pub mod recorder;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::advisory::AdvisoryEngine;
use crate::config::Config;
use crate::events::{EventBus, WsEvent};
use crate::exchange::Exchange;
use crate::market::SnapshotProvider;
use crate::memory::MemoryStore;
use crate::models::OrderIntent;
use crate::reconciler::{PositionReconciler, Reconciliation};
use crate::risk::RiskManager;

use gates::GateState;
use recorder::Recorder;

// ─── Stage / Slot ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Snapshotting,
    Reconciling,
    Advising,
    Ordering,
    Settling,
    Recording,
}

/// Intent ที่ยังไม่ถึง terminal: มีได้ไม่เกินหนึ่งตัวต่อ symbol
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub intent:       OrderIntent,
    /// `None` = ยังไม่รู้ว่า submit สำเร็จหรือไม่
    pub order_id:     Option<String>,
    pub submitted_at: Instant,
}

#[derive(Debug, Default)]
pub struct SymbolSlot {
    pub pending:   Option<PendingOrder>,
    pub gates:     GateState,
    /// ReconciliationConflict ติดกันกี่รอบ
    pub conflicts: u32,
    /// การเขียน Memory ที่อาจยังไม่เสร็จ (pipeline ถูก deadline ตัด)
    recordings:    Vec<JoinHandle<bool>>,
}

/// ผลของหนึ่ง symbol ในหนึ่ง cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    /// pipeline ของรอบก่อนยังไม่จบ
    Busy,
    Skipped(String),
    Held(String),
    Adjusted,
    /// จำนวน intent ที่ fill ในรอบนี้
    Executed { filled: usize },
    /// มี intent ค้างรอ settle ในรอบถัดไป
    Pending,
    Failed(String),
}

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RunStats {
    pub cycles:           AtomicU64,
    pub orders_submitted: AtomicU64,
    pub orders_filled:    AtomicU64,
    pub orders_failed:    AtomicU64,
    pub records:          AtomicU64,
    pub wins:             AtomicU64,
    pub losses:           AtomicU64,
    pub conflicts:        AtomicU64,
    pub alerts:           AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub cycles:           u64,
    pub orders_submitted: u64,
    pub orders_filled:    u64,
    pub orders_failed:    u64,
    pub records:          u64,
    pub wins:             u64,
    pub losses:           u64,
    pub win_rate:         f64,
    pub conflicts:        u64,
    pub alerts:           u64,
    pub unflushed:        usize,
    pub draining:         bool,
    pub stages:           HashMap<String, Stage>,
}

// ─── Coordinator ──────────────────────────────────────────────────────────────

/// External collaborators ที่ Coordinator ใช้: ส่งเข้ามาตรงๆ ไม่มี global
pub struct Collaborators {
    pub exchange:   Arc<dyn Exchange>,
    pub snapshots:  Arc<dyn SnapshotProvider>,
    pub advisory:   Arc<AdvisoryEngine>,
    pub memory:     Arc<dyn MemoryStore>,
    pub reconciler: Arc<PositionReconciler>,
    pub risk:       Arc<RiskManager>,
    pub events:     EventBus,
}

pub struct Coordinator {
    config:     Arc<Config>,
    exchange:   Arc<dyn Exchange>,
    snapshots:  Arc<dyn SnapshotProvider>,
    advisory:   Arc<AdvisoryEngine>,
    reconciler: Arc<PositionReconciler>,
    risk:       Arc<RiskManager>,
    events:     EventBus,
    recorder:   Recorder,
    slots:      HashMap<String, Arc<Mutex<SymbolSlot>>>,
    stages:     RwLock<HashMap<String, Stage>>,
    stats:      Arc<RunStats>,
    drain_tx:   watch::Sender<bool>,
    drained_tx: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, parts: Collaborators) -> Self {
        let stats = Arc::new(RunStats::default());
        let recorder = Recorder::new(
            parts.memory,
            Arc::clone(&parts.risk),
            parts.events.clone(),
            Arc::clone(&stats),
            config.store_retry,
        );

        let slots = config
            .symbols
            .iter()
            .map(|s| (s.clone(), Arc::new(Mutex::new(SymbolSlot::default()))))
            .collect();
        let stages = config
            .symbols
            .iter()
            .map(|s| (s.clone(), Stage::Idle))
            .collect();

        let (drain_tx, _)   = watch::channel(false);
        let (drained_tx, _) = watch::channel(false);

        Self {
            config,
            exchange:   parts.exchange,
            snapshots:  parts.snapshots,
            advisory:   parts.advisory,
            reconciler: parts.reconciler,
            risk:       parts.risk,
            events:     parts.events,
            recorder,
            slots,
            stages:     RwLock::new(stages),
            stats,
            drain_tx,
            drained_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn set_stage(&self, symbol: &str, stage: Stage) {
        self.stages.write().await.insert(symbol.to_string(), stage);
    }

    // ─── Startup Recovery ─────────────────────────────────────────────────────

    /// สร้าง Position table ใหม่จาก exchange state (ตอน start)
    pub async fn recover(&self) {
        for symbol in &self.config.symbols {
            let reported = match self.exchange_position(symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol = %symbol, stage = "recovery", kind = e.kind(), error = %e, "⚠️ Could not read exchange position at startup");
                    continue;
                }
            };

            match self.reconciler.reconcile_with_exchange(symbol, &reported, None).await {
                Ok(Reconciliation::Synthesized { position }) => {
                    self.events.publish(&WsEvent::PositionSynthesized { position: Box::new(position) });
                }
                Ok(result) => {
                    info!(symbol = %symbol, result = result.label(), "🔄 Position recovered");
                }
                Err(e) => {
                    warn!(symbol = %symbol, stage = "recovery", kind = e.kind(), error = %e, "⚠️ Recovery reconcile failed");
                }
            }
        }
    }

    // ─── Cycle ────────────────────────────────────────────────────────────────

    /// หนึ่ง cycle: ทุก symbol พร้อมกัน
    pub async fn run_cycle(&self) -> Vec<(String, SymbolOutcome)> {
        let cycle = self.stats.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        let held = self.recorder.flush_unflushed().await;
        if held > 0 {
            warn!(cycle, held, "⚠️ Memory records still held from earlier cycles");
        }

        self.events.publish(&WsEvent::CycleStarted {
            cycle,
            symbols: self.config.symbols.clone(),
        });
        info!(cycle, symbols = self.config.symbols.len(), "🔁 Cycle started");

        let outcomes = join_all(self.config.symbols.iter().map(|symbol| async move {
            (symbol.clone(), self.run_symbol(symbol).await)
        }))
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.events.publish(&WsEvent::CycleFinished { cycle, duration_ms });
        info!(cycle, duration_ms, "✅ Cycle finished");

        outcomes
    }

    /// Pipeline ของ symbol เดียว ภายใต้ cycle deadline
    pub async fn run_symbol(&self, symbol: &str) -> SymbolOutcome {
        let Some(slot) = self.slots.get(symbol) else {
            return SymbolOutcome::Skipped(format!("{symbol} is not configured"));
        };
        let Ok(mut slot) = Arc::clone(slot).try_lock_owned() else {
            warn!(symbol, "⏳ Previous pipeline still running, symbol skipped this cycle");
            return SymbolOutcome::Busy;
        };

        let deadline = self.config.cycle_deadline;
        let outcome = match tokio::time::timeout(deadline, self.pipeline(symbol, &mut slot)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(symbol, kind = "deadline", "⏱️ Pipeline abandoned at cycle deadline ({deadline:?})");
                SymbolOutcome::Failed(format!("cycle deadline {deadline:?} exceeded"))
            }
        };

        self.set_stage(symbol, Stage::Idle).await;
        outcome
    }

    /// Loop หลัก: หยุดเมื่อ drain แล้ว flush ทุกอย่าง
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drain_rx = self.drain_tx.subscribe();

        info!(
            interval_secs = self.config.cycle_interval.as_secs(),
            symbols       = ?self.config.symbols,
            "🚀 Coordinator loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = drain_rx.changed() => {}
            }
            if self.is_draining() {
                break;
            }
            self.run_cycle().await;
        }

        self.finish_drain().await;
    }

    // ─── Drain ────────────────────────────────────────────────────────────────

    /// ไม่เริ่ม cycle ใหม่: cycle ที่รันอยู่ทำต่อจนจบ
    pub fn request_drain(&self) {
        if !*self.drain_tx.borrow() {
            info!("🛑 Drain requested, finishing in-flight pipelines");
            self.events.publish(&WsEvent::Draining);
        }
        self.drain_tx.send_replace(true);
    }

    pub fn is_draining(&self) -> bool {
        *self.drain_tx.borrow()
    }

    pub async fn wait_drained(&self) {
        let mut rx = self.drained_tx.subscribe();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    async fn finish_drain(&self) {
        // รอ pipeline ที่ค้างอยู่ (ถ้ามี) ให้ปล่อย slot
        for slot in self.slots.values() {
            let mut slot = slot.lock().await;
            await_recordings(&mut slot).await;
        }

        let held = self.recorder.flush_unflushed().await;
        if held > 0 {
            error!(held, "🚨 Memory records could not be flushed before shutdown");
        }
        if let Err(e) = self.recorder.memory().flush().await {
            error!(kind = e.kind(), error = %e, "🚨 Memory store flush failed");
        }

        let stats = self.stats().await;
        info!(
            cycles    = stats.cycles,
            orders    = stats.orders_submitted,
            filled    = stats.orders_filled,
            records   = stats.records,
            wins      = stats.wins,
            losses    = stats.losses,
            win_rate  = format!("{:.1}%", stats.win_rate * 100.0),
            unflushed = stats.unflushed,
            "📊 Run statistics"
        );

        self.drained_tx.send_replace(true);
    }

    // ─── Stats ────────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        let wins   = s.wins.load(Ordering::Relaxed);
        let losses = s.losses.load(Ordering::Relaxed);
        let records = s.records.load(Ordering::Relaxed);

        StatsSnapshot {
            cycles:           s.cycles.load(Ordering::Relaxed),
            orders_submitted: s.orders_submitted.load(Ordering::Relaxed),
            orders_filled:    s.orders_filled.load(Ordering::Relaxed),
            orders_failed:    s.orders_failed.load(Ordering::Relaxed),
            records,
            wins,
            losses,
            win_rate:         if records > 0 { wins as f64 / records as f64 } else { 0.0 },
            conflicts:        s.conflicts.load(Ordering::Relaxed),
            alerts:           s.alerts.load(Ordering::Relaxed),
            unflushed:        self.recorder.unflushed_len().await,
            draining:         self.is_draining(),
            stages:           self.stages.read().await.clone(),
        }
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        self.recorder.memory()
    }
}

/// รอการเขียน Memory ที่ค้างจาก pipeline ก่อนหน้าให้จบ
pub(crate) async fn await_recordings(slot: &mut SymbolSlot) {
    while let Some(handle) = slot.recordings.first_mut() {
        if let Err(e) = handle.await {
            error!(error = %e, "🚨 Memory recording task failed");
        }
        slot.recordings.remove(0);
    }
}

/// poll แรกถามทันที ที่เหลือเว้นตาม `settle_poll_interval`
pub(crate) fn settle_delay(config: &Config, poll: u32) -> Duration {
    if poll == 0 { Duration::ZERO } else { config.settle_poll_interval }
}

// ─── Test Harness ─────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::{test_config, Harness, BTC, OPEN_LONG};
    use super::*;
    use crate::advisory::testing::ScriptedModel;
    use crate::memory::JournalStore;
    use crate::models::{PositionSide, StrategyLabel};

    const ETH: &str = "ETH/USDT";

    fn outcome_of<'a>(outcomes: &'a [(String, SymbolOutcome)], symbol: &str) -> &'a SymbolOutcome {
        &outcomes.iter().find(|(s, _)| s == symbol).unwrap().1
    }

    #[tokio::test]
    async fn test_recover_synthesizes_unknown_position() {
        let h = Harness::new(ScriptedModel::new(Vec::new())).await;
        h.exchange.set_position(BTC, PositionSide::Short, 0.02, 49_000.0).await;

        h.coordinator.recover().await;

        let local = h.reconciler.get_local(BTC).await;
        assert_eq!(local.side, PositionSide::Short);
        assert_eq!(local.size, 0.02);
        assert_eq!(local.strategy, StrategyLabel::Unknown);
        assert!(local.needs_attention);
        assert!(local.stop_loss_pct.is_none());
    }

    #[tokio::test]
    async fn test_drain_stops_loop() {
        let h = Harness::new(ScriptedModel::new(Vec::new())).await;
        let task = tokio::spawn(Arc::clone(&h.coordinator).run());

        h.coordinator.request_drain();
        tokio::time::timeout(Duration::from_secs(2), h.coordinator.wait_drained())
            .await
            .expect("drain should finish");
        task.await.unwrap();

        let stats = h.coordinator.stats().await;
        assert!(stats.draining);
        assert!(stats.cycles <= 1);
        assert_eq!(stats.unflushed, 0);
    }

    #[tokio::test]
    async fn test_run_cycle_reports_every_symbol() {
        let h = Harness::new(ScriptedModel::new(Vec::new())).await;
        let outcomes = h.coordinator.run_cycle().await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (BTC.to_string(), SymbolOutcome::Held("hold".to_string())));
        assert_eq!(h.coordinator.stats().await.cycles, 1);
    }

    #[tokio::test]
    async fn test_failing_symbol_does_not_disturb_others() {
        let config = Config {
            symbols:   vec![BTC.to_string(), ETH.to_string()],
            min_sizes: HashMap::new(),
            ..test_config()
        };
        let h = Harness::build(config, ScriptedModel::always(OPEN_LONG), Arc::new(JournalStore::in_memory())).await;

        // ETH ไม่มี snapshot
        let outcomes = h.coordinator.run_cycle().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcome_of(&outcomes, BTC), &SymbolOutcome::Executed { filled: 1 });
        assert!(matches!(outcome_of(&outcomes, ETH), SymbolOutcome::Skipped(_)));

        let btc = h.reconciler.get_local(BTC).await;
        assert_eq!(btc.side, PositionSide::Long);
        assert_eq!(btc.size, 0.01);
        assert!(!h.reconciler.get_local(ETH).await.is_open());

        // ETH มี snapshot แต่ exchange ไม่มีตลาด: order ถูก reject
        h.snapshots.set_price(ETH, 3_000.0).await;
        let outcomes = h.coordinator.run_cycle().await;
        assert_eq!(outcome_of(&outcomes, BTC), &SymbolOutcome::Held("already positioned".to_string()));
        assert!(matches!(outcome_of(&outcomes, ETH), SymbolOutcome::Failed(reason) if reason.contains("no market")));

        let after = h.reconciler.get_local(BTC).await;
        assert_eq!(after.position_id, btc.position_id);
        assert_eq!((after.side, after.size, after.entry_price), (btc.side, btc.size, btc.entry_price));
        assert!(!h.reconciler.get_local(ETH).await.is_open());
        assert_eq!(h.exchange.get_position(BTC).await.unwrap().size, 0.01);
        assert_eq!(h.exchange.submitted_count().await, 1);
    }
}
