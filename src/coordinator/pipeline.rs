//! # coordinator::pipeline — หนึ่ง symbol หนึ่ง cycle
//!
//! 1. รอ Memory write ที่ค้างจากรอบก่อน
//! 2. Snapshot (ล่ม → skip)
//! 3. Resolve pending intent ของรอบก่อนจาก order status
//! 4. อ่าน exchange position → reconcile (conflict → skip)
//! 5. SL/TP guard ที่ mark price: โดนแล้วปิดทันที ไม่ถาม Advisory
//! 6. Advisory → gates → plan
//! 7. ส่ง intent ทีละตัว (open ผ่าน risk ตอนจะส่ง) → settle → apply → record

use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::planner::{self, Plan};
use super::{await_recordings, settle_delay, Coordinator, PendingOrder, Stage, SymbolOutcome, SymbolSlot};
use crate::advisory::AdviceLimits;
use crate::error::TradeError;
use crate::events::WsEvent;
use crate::exchange::with_retry;
use crate::models::{
    ClosedPosition, ExchangePosition, FillResult, Insight, IntentPurpose, MarketRegime,
    MarketSnapshot, MemoryRecord, OrderIntent, OrderState, OrderStatus, Position, Recommendation,
};
use crate::reconciler::Reconciliation;
use crate::risk::RiskDecision;

/// ผลของการส่ง intent หนึ่งตัว
enum Settlement {
    /// fill แล้วและ apply เข้า Position table แล้ว
    Filled(Position),
    /// reject / cancel / fill เป็นศูนย์: Position ไม่เปลี่ยน
    Unfilled(String),
    /// ยังไม่ terminal: resolve รอบหน้า
    Pending,
    Failed(String),
}

/// `Err` = จบ pipeline ก่อนกำหนดด้วย outcome นั้น
type Step<T> = Result<T, SymbolOutcome>;

impl Coordinator {
    pub(super) async fn pipeline(&self, symbol: &str, slot: &mut SymbolSlot) -> SymbolOutcome {
        match self.stages(symbol, slot).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn stages(&self, symbol: &str, slot: &mut SymbolSlot) -> Step<SymbolOutcome> {
        await_recordings(slot).await;

        // ── Snapshotting ──────────────────────────────────────────────────────
        self.set_stage(symbol, Stage::Snapshotting).await;
        let snapshot = self.take_snapshot(symbol).await?;
        let regime = snapshot.regime();

        // ── Reconciling ───────────────────────────────────────────────────────
        self.set_stage(symbol, Stage::Reconciling).await;
        let in_flight = self.resolve_pending(symbol, slot, &snapshot).await?;
        let reported = self.exchange_position(symbol).await.map_err(|e| {
            warn!(symbol, stage = "reconciling", kind = e.kind(), error = %e, "⚠️ Exchange position unavailable, symbol skipped");
            SymbolOutcome::Skipped(e.to_string())
        })?;
        let position = self.reconcile(symbol, slot, &reported, in_flight.as_ref(), regime).await?;
        let mark = reported.mark().unwrap_or(snapshot.price);

        // ── Guard / Advising ──────────────────────────────────────────────────
        let rec = match position.threshold_hit(mark) {
            Some(reason) => {
                let pnl_pct = position.pnl_pct(mark);
                warn!(symbol, reason = %reason, mark, pnl_pct, "🛑 Threshold hit, closing without advisory");
                Recommendation::threshold_close(symbol, reason, pnl_pct)
            }
            None => self.advise(symbol, slot, &snapshot, &position).await?,
        };

        // ── Ordering ──────────────────────────────────────────────────────────
        let intents = match planner::plan(&rec, &position, self.config.strategy) {
            Plan::Nothing(why) => {
                debug!(symbol, action = rec.label(), why, "💤 Nothing to do");
                return Ok(SymbolOutcome::Held(why.to_string()));
            }
            Plan::Adjust { stop_loss_pct, take_profit_pct } => {
                return Ok(self.adjust(symbol, stop_loss_pct, take_profit_pct).await);
            }
            Plan::Orders(intents) => self
                .confirm_opens(symbol, slot, intents)
                .into_iter()
                .map(|intent| intent.limit_entry(mark, self.config.entry_limit_offset_pct))
                .collect::<Vec<_>>(),
        };
        if intents.is_empty() {
            return Ok(SymbolOutcome::Held("open not approved".to_string()));
        }

        let mut filled = 0;
        for intent in intents {
            let purpose = intent.purpose;
            // risk gate นับ open ของวัน: เช็คตอนจะส่งจริงเท่านั้น (หลัง close ของ reversal fill แล้ว)
            if purpose == IntentPurpose::Open {
                if let RiskDecision::Blocked(reason) = self.risk.pre_trade_check(symbol, rec.confidence).await {
                    warn!(symbol, side = %intent.target_side(), reason = %reason, "⛔ Open blocked by risk gate");
                    if filled == 0 {
                        return Ok(SymbolOutcome::Held("open not approved".to_string()));
                    }
                    break;
                }
            }
            match self.execute(symbol, slot, intent, mark, regime).await {
                Settlement::Filled(position) => {
                    filled += 1;
                    // ปิดไม่หมด: ห้ามเปิดฝั่งใหม่ทับ
                    if purpose == IntentPurpose::Close && position.is_open() {
                        warn!(symbol, remaining = position.size, "🧩 Close left a remainder, skipping the rest of the plan");
                        break;
                    }
                }
                Settlement::Unfilled(reason) if filled == 0 => return Ok(SymbolOutcome::Failed(reason)),
                Settlement::Unfilled(_) => break,
                Settlement::Pending => return Ok(SymbolOutcome::Pending),
                Settlement::Failed(reason) => return Ok(SymbolOutcome::Failed(reason)),
            }
        }
        Ok(SymbolOutcome::Executed { filled })
    }

    // ─── Snapshot ─────────────────────────────────────────────────────────────

    async fn take_snapshot(&self, symbol: &str) -> Step<MarketSnapshot> {
        let timeout = self.config.snapshot_timeout;
        let result = match tokio::time::timeout(timeout, self.snapshots.snapshot(symbol)).await {
            Ok(Ok(snapshot)) if snapshot.price.is_finite() && snapshot.price > 0.0 => Ok(snapshot),
            Ok(Ok(snapshot)) => Err(TradeError::SnapshotUnavailable {
                symbol: symbol.to_string(),
                reason: format!("invalid price {}", snapshot.price),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TradeError::SnapshotUnavailable {
                symbol: symbol.to_string(),
                reason: format!("timed out after {timeout:?}"),
            }),
        };

        result.map_err(|e| {
            warn!(symbol, stage = "snapshotting", kind = e.kind(), error = %e, "📭 Snapshot unavailable, symbol skipped");
            SymbolOutcome::Skipped(e.to_string())
        })
    }

    // ─── Pending Intent ───────────────────────────────────────────────────────

    /// คืน intent ที่ต้องให้ reconcile ใช้อธิบาย exchange state (ถ้ามี)
    async fn resolve_pending(
        &self,
        symbol: &str,
        slot: &mut SymbolSlot,
        snapshot: &MarketSnapshot,
    ) -> Step<Option<OrderIntent>> {
        let Some(pending) = slot.pending.clone() else {
            return Ok(None);
        };

        let Some(order_id) = pending.order_id.clone() else {
            info!(symbol, intent_id = %pending.intent.intent_id, "🔎 Unconfirmed submit, resolving from exchange position");
            slot.pending = None;
            return Ok(Some(pending.intent));
        };

        let mut status = match self.order_status(symbol, &order_id).await {
            Ok(status) => status,
            Err(e) if e.is_transient() => {
                warn!(symbol, stage = "reconciling", kind = e.kind(), order_id = %order_id, error = %e, "⏳ Pending order status unavailable");
                return Err(SymbolOutcome::Skipped(e.to_string()));
            }
            Err(e) => {
                warn!(symbol, stage = "reconciling", kind = e.kind(), order_id = %order_id, error = %e, "❓ Pending order unknown to exchange");
                slot.pending = None;
                return Ok(Some(pending.intent));
            }
        };

        if !status.state.is_terminal() {
            let age = pending.submitted_at.elapsed();
            if age < self.config.stale_order_after {
                info!(symbol, order_id = %order_id, state = ?status.state, "⏳ Intent still pending, symbol skipped");
                return Err(SymbolOutcome::Skipped("intent pending".to_string()));
            }

            warn!(symbol, order_id = %order_id, age_secs = age.as_secs(), "🧹 Canceling stale order");
            if let Err(e) = self.cancel(symbol, &order_id).await {
                warn!(symbol, stage = "reconciling", kind = e.kind(), order_id = %order_id, error = %e, "⚠️ Stale order cancel failed");
                return Err(SymbolOutcome::Skipped(e.to_string()));
            }
            status = match self.order_status(symbol, &order_id).await {
                Ok(status) if status.state.is_terminal() => status,
                Ok(_)  => return Err(SymbolOutcome::Skipped("stale order cancel pending".to_string())),
                Err(e) => return Err(SymbolOutcome::Skipped(e.to_string())),
            };
        }

        slot.pending = None;
        let settlement = self
            .settle(symbol, slot, &pending.intent, &order_id, &status, snapshot.price, snapshot.regime())
            .await;
        Ok(match settlement {
            Settlement::Failed(_) => Some(pending.intent),
            _ => None,
        })
    }

    // ─── Reconcile ────────────────────────────────────────────────────────────

    async fn reconcile(
        &self,
        symbol: &str,
        slot: &mut SymbolSlot,
        reported: &ExchangePosition,
        in_flight: Option<&OrderIntent>,
        regime: MarketRegime,
    ) -> Step<Position> {
        match self.reconciler.reconcile_with_exchange(symbol, reported, in_flight).await {
            Ok(result) => {
                if let Some(closed) = result.closed() {
                    self.spawn_record(symbol, slot, closed.clone(), regime);
                }
                slot.conflicts = 0;
                match &result {
                    Reconciliation::Synthesized { position } => {
                        self.events.publish(&WsEvent::PositionSynthesized { position: Box::new(position.clone()) });
                    }
                    Reconciliation::Adopted { position } | Reconciliation::Reversed { position, .. } => {
                        self.events.publish(&WsEvent::PositionOpened { position: Box::new(position.clone()) });
                    }
                    _ => {}
                }
                if result.changed() {
                    info!(symbol, result = result.label(), "🔄 Reconciled with exchange");
                }
                if result.closed().is_some() {
                    self.finish_recording(symbol, slot).await;
                }
                Ok(result.position())
            }

            Err(TradeError::ReconciliationConflict { local, exchange, .. }) => {
                slot.conflicts += 1;
                self.stats.conflicts.fetch_add(1, AtomicOrdering::Relaxed);
                let consecutive = slot.conflicts;

                warn!(
                    symbol,
                    stage    = "reconciling",
                    kind     = "reconciliation_conflict",
                    local    = %local,
                    exchange = %exchange,
                    consecutive,
                    "⚔️ Exchange side flipped without an intent, local kept"
                );
                self.events.publish(&WsEvent::ReconciliationConflict {
                    symbol:   symbol.to_string(),
                    local:    local.to_string(),
                    exchange: exchange.to_string(),
                    consecutive,
                });

                if consecutive == self.config.conflict_alert_after {
                    self.stats.alerts.fetch_add(1, AtomicOrdering::Relaxed);
                    error!(symbol, kind = "reconciliation_conflict", consecutive, "🚨 Reconciliation conflict persists, operator action required");
                    self.events.publish(&WsEvent::Alert {
                        symbol:  Some(symbol.to_string()),
                        kind:    "reconciliation_conflict".to_string(),
                        message: format!("local {local} vs exchange {exchange} for {consecutive} consecutive cycles"),
                    });
                }
                Err(SymbolOutcome::Skipped("reconciliation conflict".to_string()))
            }

            Err(e) => {
                error!(symbol, stage = "reconciling", kind = e.kind(), error = %e, "💥 Reconcile failed");
                Err(SymbolOutcome::Failed(e.to_string()))
            }
        }
    }

    // ─── Advising ─────────────────────────────────────────────────────────────

    async fn advise(
        &self,
        symbol: &str,
        slot: &mut SymbolSlot,
        snapshot: &MarketSnapshot,
        position: &Position,
    ) -> Step<Recommendation> {
        let flat = !position.is_open();
        if !flat {
            slot.gates.skip_cycles = 0;
        } else if slot.gates.take_skip() {
            debug!(symbol, remaining = slot.gates.skip_cycles, "😴 Hold backoff, advisory skipped");
            return Err(SymbolOutcome::Held("hold backoff".to_string()));
        }

        self.set_stage(symbol, Stage::Advising).await;
        let insight = self.insight(symbol).await;
        let limits = AdviceLimits::for_symbol(&self.config, symbol);

        let rec = match self.advisory.recommend(symbol, snapshot, &insight, position, &limits).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!(symbol, stage = "advising", kind = e.kind(), error = %e, "🤷 Advisory unavailable, holding");
                Recommendation::hold(symbol, e.to_string())
            }
        };
        info!(
            symbol,
            action     = rec.label(),
            confidence = rec.confidence,
            rationale  = %rec.rationale,
            "🧭 Recommendation"
        );

        slot.gates.observe(&self.config.gates, &rec, flat);
        Ok(rec)
    }

    /// Insight ล่าสุด: store ล่มก็ยังถาม Advisory ได้ด้วย insight ว่าง
    async fn insight(&self, symbol: &str) -> Insight {
        let timeout = self.config.store_retry.timeout;
        match tokio::time::timeout(timeout, self.recorder.memory().summarize(symbol, None)).await {
            Ok(Ok(insight)) => insight,
            Ok(Err(e)) => {
                warn!(symbol, stage = "advising", kind = e.kind(), error = %e, "⚠️ Insight unavailable, advising without memory");
                Insight::empty(symbol, None)
            }
            Err(_) => {
                warn!(symbol, stage = "advising", kind = "store_unavailable", "⚠️ Insight timed out after {timeout:?}, advising without memory");
                Insight::empty(symbol, None)
            }
        }
    }

    /// Open ต้องผ่าน double confirmation: close ผ่านเสมอ
    fn confirm_opens(&self, symbol: &str, slot: &mut SymbolSlot, intents: Vec<OrderIntent>) -> Vec<OrderIntent> {
        let mut confirmed = Vec::with_capacity(intents.len());
        for intent in intents {
            if intent.purpose == IntentPurpose::Open {
                let side = intent.target_side();
                if !slot.gates.confirm_open(&self.config.gates, side) {
                    info!(symbol, side = %side, "✋ Open awaiting a second confirmation");
                    continue;
                }
            }
            confirmed.push(intent);
        }
        confirmed
    }

    async fn adjust(
        &self,
        symbol: &str,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
    ) -> SymbolOutcome {
        match self.reconciler.adjust_thresholds(symbol, stop_loss_pct, take_profit_pct).await {
            Ok(position) => {
                info!(
                    symbol,
                    stop_loss_pct   = ?position.stop_loss_pct,
                    take_profit_pct = ?position.take_profit_pct,
                    "🎚️ Thresholds adjusted"
                );
                SymbolOutcome::Adjusted
            }
            Err(e) => {
                warn!(symbol, stage = "ordering", kind = e.kind(), error = %e, "⚠️ Threshold adjust rejected");
                SymbolOutcome::Failed(e.to_string())
            }
        }
    }

    // ─── Ordering / Settling ──────────────────────────────────────────────────

    async fn execute(
        &self,
        symbol: &str,
        slot: &mut SymbolSlot,
        intent: OrderIntent,
        mark: f64,
        regime: MarketRegime,
    ) -> Settlement {
        self.set_stage(symbol, Stage::Ordering).await;

        // pending ก่อน submit: deadline ตัดกลางทางก็ยัง resolve ได้รอบหน้า
        slot.pending = Some(PendingOrder {
            intent:       intent.clone(),
            order_id:     None,
            submitted_at: Instant::now(),
        });

        let exchange = self.exchange.as_ref();
        let order = &intent;
        let submitted = with_retry(&self.config.exchange_retry, "submit_order", symbol, move || {
            exchange.submit_order(order)
        })
        .await;

        let order_id = match submitted {
            Ok(order_id) => order_id,
            Err(e) if e.is_transient() => {
                error!(
                    symbol,
                    stage     = "ordering",
                    kind      = e.kind(),
                    intent_id = %intent.intent_id,
                    error     = %e,
                    "🔌 Submit outcome unknown, intent held for next cycle"
                );
                return Settlement::Failed(e.to_string());
            }
            Err(e) => {
                slot.pending = None;
                self.stats.orders_failed.fetch_add(1, AtomicOrdering::Relaxed);
                self.risk.record_failure().await;
                warn!(symbol, stage = "ordering", kind = e.kind(), error = %e, "🚫 Order rejected");
                return Settlement::Unfilled(e.to_string());
            }
        };

        if let Some(pending) = slot.pending.as_mut() {
            pending.order_id = Some(order_id.clone());
        }
        self.stats.orders_submitted.fetch_add(1, AtomicOrdering::Relaxed);
        info!(
            symbol,
            order_id = %order_id,
            side     = ?intent.side,
            size     = intent.size,
            purpose  = ?intent.purpose,
            "📨 Order submitted"
        );
        self.events.publish(&WsEvent::OrderSubmitted {
            order_id: order_id.clone(),
            intent:   Box::new(intent.clone()),
        });

        self.set_stage(symbol, Stage::Settling).await;
        let Some(status) = self.await_terminal(symbol, &order_id).await else {
            info!(symbol, order_id = %order_id, "⏳ Order not settled yet, resolving next cycle");
            return Settlement::Pending;
        };

        slot.pending = None;
        self.settle(symbol, slot, &intent, &order_id, &status, mark, regime).await
    }

    async fn await_terminal(&self, symbol: &str, order_id: &str) -> Option<OrderStatus> {
        for poll in 0..self.config.settle_polls.max(1) {
            tokio::time::sleep(settle_delay(&self.config, poll)).await;
            match self.order_status(symbol, order_id).await {
                Ok(status) if status.state.is_terminal() => return Some(status),
                Ok(_) => {}
                Err(e) => {
                    warn!(symbol, stage = "settling", kind = e.kind(), order_id, error = %e, "⚠️ Order status poll failed");
                    if !e.is_transient() {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Terminal status → apply fill (ถ้ามี) → record close (ถ้ามี)
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        symbol: &str,
        slot: &mut SymbolSlot,
        intent: &OrderIntent,
        order_id: &str,
        status: &OrderStatus,
        mark: f64,
        regime: MarketRegime,
    ) -> Settlement {
        self.events.publish(&WsEvent::OrderSettled {
            symbol:         symbol.to_string(),
            order_id:       order_id.to_string(),
            intent_id:      intent.intent_id,
            state:          status.state,
            filled_size:    status.filled_size,
            avg_fill_price: status.avg_fill_price,
        });

        let executed = matches!(status.state, OrderState::Filled | OrderState::PartiallyFilled)
            && status.filled_size > 0.0;
        if !executed {
            self.stats.orders_failed.fetch_add(1, AtomicOrdering::Relaxed);
            self.risk.record_failure().await;
            warn!(symbol, stage = "settling", order_id, state = ?status.state, "🚫 Order ended without a fill");
            return Settlement::Unfilled(format!("order {order_id} ended {:?}", status.state));
        }
        if status.state == OrderState::PartiallyFilled {
            warn!(symbol, order_id, filled = status.filled_size, requested = intent.size, "🧩 Order partially filled");
        }

        let fill = FillResult {
            order_id:       order_id.to_string(),
            filled_size:    status.filled_size,
            avg_fill_price: status.avg_fill_price.filter(|p| p.is_finite() && *p > 0.0).unwrap_or(mark),
        };
        let applied = match self.reconciler.apply(symbol, intent, &fill).await {
            Ok(applied) => applied,
            Err(e) => {
                error!(symbol, stage = "settling", kind = e.kind(), order_id, error = %e, "💥 Fill could not be applied");
                return Settlement::Failed(e.to_string());
            }
        };

        let closed = applied.closed.is_some();
        if let Some(record) = applied.closed {
            self.spawn_record(symbol, slot, record, regime);
        }

        self.stats.orders_filled.fetch_add(1, AtomicOrdering::Relaxed);
        self.risk.record_success().await;
        info!(symbol, order_id, price = fill.avg_fill_price, size = fill.filled_size, "✅ Order filled");

        if intent.purpose == IntentPurpose::Open {
            self.events.publish(&WsEvent::PositionOpened { position: Box::new(applied.position.clone()) });
        }
        if closed {
            self.finish_recording(symbol, slot).await;
        }
        Settlement::Filled(applied.position)
    }

    // ─── Recording ────────────────────────────────────────────────────────────

    /// หนึ่ง ClosedPosition → หนึ่ง Memory Record
    ///
    /// ต้องเรียกทันทีที่ได้ ClosedPosition โดยไม่มี `.await` คั่น: deadline
    /// ของ cycle ตัดได้เฉพาะที่ await ถ้าตัดก่อน spawn record จะหายไป
    fn spawn_record(&self, symbol: &str, slot: &mut SymbolSlot, closed: ClosedPosition, regime: MarketRegime) {
        info!(
            symbol,
            reason  = %closed.reason,
            entry   = closed.position.entry_price,
            exit    = closed.exit_price,
            pnl_pct = closed.pnl_pct,
            "📕 Position closed"
        );

        let record = MemoryRecord::from_close(&closed, regime, self.config.neutral_band_pct);
        self.events.publish(&WsEvent::PositionClosed { closed: Box::new(closed) });
        slot.recordings.push(self.recorder.spawn(record));
    }

    /// รอให้ record ที่ spawn ไปลง store ก่อนไปต่อ
    async fn finish_recording(&self, symbol: &str, slot: &mut SymbolSlot) {
        self.set_stage(symbol, Stage::Recording).await;
        await_recordings(slot).await;
    }

    // ─── Exchange Calls ───────────────────────────────────────────────────────

    pub(super) async fn exchange_position(&self, symbol: &str) -> Result<ExchangePosition, TradeError> {
        let exchange = self.exchange.as_ref();
        with_retry(&self.config.exchange_retry, "get_position", symbol, move || {
            exchange.get_position(symbol)
        })
        .await
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, TradeError> {
        let exchange = self.exchange.as_ref();
        with_retry(&self.config.exchange_retry, "get_order_status", symbol, move || {
            exchange.get_order_status(order_id)
        })
        .await
    }

    async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), TradeError> {
        let exchange = self.exchange.as_ref();
        with_retry(&self.config.exchange_retry, "cancel_order", symbol, move || {
            exchange.cancel_order(order_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::recorder::testing::FlakyStore;
    use super::super::testing::{test_config, Harness, BTC, OPEN_LONG, OPEN_SHORT};
    use super::*;
    use crate::advisory::testing::{Reply, ScriptedModel};
    use crate::config::{Config, RetryPolicy};
    use crate::exchange::Exchange;
    use crate::memory::{JournalStore, MemoryStore};
    use crate::models::{CloseReason, MemoryQuery, Outcome, PositionSide, StrategyLabel};
    use crate::risk::RiskConfig;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    async fn records(h: &Harness) -> Vec<MemoryRecord> {
        h.coordinator.memory().query(MemoryQuery::symbol(BTC)).await.unwrap().collect()
    }

    #[tokio::test]
    async fn test_btc_open_long_from_flat() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;

        assert_eq!(h.cycle().await, SymbolOutcome::Executed { filled: 1 });

        let local = h.reconciler.get_local(BTC).await;
        assert_eq!(local.side, PositionSide::Long);
        assert_eq!(local.entry_price, 50_000.0);
        assert_eq!(local.size, 0.01);
        assert_eq!(local.leverage, 10);
        assert_eq!(local.strategy, StrategyLabel::Balanced);
        assert_eq!(local.stop_loss_pct, Some(2.0));
        assert_eq!(local.take_profit_pct, Some(5.0));

        assert_eq!(h.exchange.get_position(BTC).await.unwrap().side, PositionSide::Long);
        assert!(records(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_closes_before_advisory() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        h.cycle().await;
        assert_eq!(h.model.calls(), 1);

        // -2.5% บน long ที่ SL 2%: model ยังอยากเปิด long แต่ไม่ถูกถาม
        h.price(48_750.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Executed { filled: 1 });
        assert_eq!(h.model.calls(), 1);
        assert!(!h.reconciler.get_local(BTC).await.is_open());

        let records = records(&h).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Failure);
        assert_eq!(records[0].reason, CloseReason::StopLoss);
        assert!((records[0].pnl_pct + 2.5).abs() < 1e-9);

        // insight รอบถัดไปเห็น record นี้แล้ว
        let insight = h.coordinator.memory().summarize(BTC, None).await.unwrap();
        assert_eq!(insight.count, 1);
        assert_eq!(insight.losses, 1);
    }

    #[tokio::test]
    async fn test_advisory_timing_out_twice_holds() {
        let h = Harness::new(ScriptedModel::new(vec![
            Reply::Stall(Duration::from_millis(500)),
            Reply::Stall(Duration::from_millis(500)),
        ]))
        .await;

        assert_eq!(h.cycle().await, SymbolOutcome::Held("hold".to_string()));
        assert_eq!(h.model.calls(), 2);
        assert_eq!(h.exchange.submitted_count().await, 0);
        assert!(!h.reconciler.get_local(BTC).await.is_open());
    }

    #[tokio::test]
    async fn test_exchange_closed_position_is_recorded() {
        let h = Harness::new(ScriptedModel::new(vec![Reply::Text(OPEN_LONG.to_string())])).await;
        h.cycle().await;

        h.exchange.close_externally(BTC).await;
        h.price(51_000.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Held("hold".to_string()));

        assert!(!h.reconciler.get_local(BTC).await.is_open());
        let records = records(&h).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, CloseReason::ExchangeClosed);
        assert_eq!(records[0].outcome, Outcome::Success);
        assert!((records[0].pnl_pct - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_single_pending_intent_per_symbol() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        h.exchange.hold_orders(true).await;

        assert_eq!(h.cycle().await, SymbolOutcome::Pending);
        assert_eq!(h.cycle().await, SymbolOutcome::Skipped("intent pending".to_string()));
        assert_eq!(h.exchange.submitted_count().await, 1);
        assert!(!h.reconciler.get_local(BTC).await.is_open());

        h.exchange.fill_working("paper-1").await;
        assert_eq!(h.cycle().await, SymbolOutcome::Held("already positioned".to_string()));
        assert_eq!(h.reconciler.get_local(BTC).await.side, PositionSide::Long);
        assert_eq!(h.exchange.submitted_count().await, 1);
        assert_eq!(h.coordinator.stats().await.orders_filled, 1);
    }

    #[tokio::test]
    async fn test_reversal_closes_then_opens() {
        let h = Harness::new(ScriptedModel::new(vec![
            Reply::Text(OPEN_LONG.to_string()),
            Reply::Text(OPEN_SHORT.to_string()),
        ]))
        .await;
        h.cycle().await;

        h.price(51_000.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Executed { filled: 2 });

        let local = h.reconciler.get_local(BTC).await;
        assert_eq!(local.side, PositionSide::Short);
        assert_eq!(local.entry_price, 51_000.0);

        let records = records(&h).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, CloseReason::Reversal);
        assert_eq!(records[0].side, PositionSide::Long);
        assert_eq!(records[0].outcome, Outcome::Success);
        assert_eq!(h.exchange.submitted_count().await, 3);
    }

    #[tokio::test]
    async fn test_reversal_counts_open_only_when_submitted() {
        let h = Harness::new(ScriptedModel::new(vec![
            Reply::Text(OPEN_LONG.to_string()),
            Reply::Text(OPEN_SHORT.to_string()),
        ]))
        .await;
        h.cycle().await;
        assert_eq!(h.risk.status().await.opens_today, 1);

        // close ของ reversal ยังไม่ fill: open ยังไม่ถูกนับ
        h.exchange.hold_orders(true).await;
        h.price(51_000.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Pending);
        assert_eq!(h.risk.status().await.opens_today, 1);
        assert_eq!(h.exchange.submitted_count().await, 2);
    }

    #[tokio::test]
    async fn test_reversal_blocked_by_daily_limit_still_closes() {
        let config = Config {
            risk: RiskConfig { max_opens_per_day: 1, ..RiskConfig::default() },
            ..test_config()
        };
        let model = ScriptedModel::new(vec![
            Reply::Text(OPEN_LONG.to_string()),
            Reply::Text(OPEN_SHORT.to_string()),
        ]);
        let h = Harness::build(config, model, Arc::new(JournalStore::in_memory())).await;
        h.cycle().await;

        h.price(51_000.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Executed { filled: 1 });
        assert!(!h.reconciler.get_local(BTC).await.is_open());
        assert_eq!(h.risk.status().await.opens_today, 1);
        assert_eq!(h.exchange.submitted_count().await, 2);

        let records = records(&h).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, CloseReason::Reversal);
    }

    #[tokio::test]
    async fn test_close_recorded_when_deadline_hits_after_fill() {
        let config = Config { cycle_deadline: Duration::from_millis(200), ..test_config() };
        let h = Harness::build(config, ScriptedModel::always(OPEN_LONG), Arc::new(JournalStore::in_memory())).await;
        h.cycle().await;

        h.exchange.hold_orders(true).await;
        h.price(48_750.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Pending);
        h.exchange.fill_working("paper-2").await;

        // fill ถูก apply แล้วแต่ pipeline ค้างที่ risk จนเลย deadline
        {
            let _ledger = h.risk.freeze().await;
            assert!(matches!(h.cycle().await, SymbolOutcome::Failed(reason) if reason.contains("deadline")));
        }
        assert!(!h.reconciler.get_local(BTC).await.is_open());

        h.exchange.hold_orders(false).await;
        h.cycle().await;
        let recorded = records(&h).await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].reason, CloseReason::StopLoss);
        assert!((recorded[0].pnl_pct + 2.5).abs() < 1e-9);

        h.cycle().await;
        assert_eq!(records(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_entry_waits_for_fill() {
        let config = Config { entry_limit_offset_pct: 0.5, ..test_config() };
        let h = Harness::build(config, ScriptedModel::always(OPEN_LONG), Arc::new(JournalStore::in_memory())).await;

        assert_eq!(h.cycle().await, SymbolOutcome::Pending);
        assert_eq!(h.exchange.working_orders(BTC).await, 1);
        assert!(!h.reconciler.get_local(BTC).await.is_open());

        h.exchange.fill_working("paper-1").await;
        assert_eq!(h.cycle().await, SymbolOutcome::Held("already positioned".to_string()));
        assert_eq!(h.reconciler.get_local(BTC).await.side, PositionSide::Long);
        assert_eq!(h.exchange.submitted_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_outage_halts_opens_until_flushed() {
        let store = Arc::new(FlakyStore::down());
        let h = Harness::build(test_config(), ScriptedModel::always(OPEN_LONG), store.clone()).await;
        h.cycle().await;

        h.price(48_750.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Executed { filled: 1 });
        assert!(h.risk.is_killed().await);
        assert_eq!(h.coordinator.stats().await.unflushed, 1);
        assert_eq!(store.inner.len().await, 0);

        store.down.store(false, Ordering::SeqCst);
        let outcomes = h.coordinator.run_cycle().await;
        assert_eq!(store.inner.len().await, 1);
        assert_eq!(outcomes[0].1, SymbolOutcome::Held("open not approved".to_string()));
        assert_eq!(h.exchange.submitted_count().await, 2);
    }

    #[tokio::test]
    async fn test_repeated_conflict_raises_one_alert() {
        let config = Config { conflict_alert_after: 2, ..test_config() };
        let h = Harness::build(config, ScriptedModel::always(OPEN_LONG), Arc::new(JournalStore::in_memory())).await;
        h.cycle().await;

        h.exchange.set_position(BTC, PositionSide::Short, 0.01, 50_500.0).await;
        let mut rx = h.events.subscribe();
        for _ in 0..3 {
            assert_eq!(h.cycle().await, SymbolOutcome::Skipped("reconciliation conflict".to_string()));
        }

        let mut alerts = 0;
        while let Ok(msg) = rx.try_recv() {
            if msg.contains(r#""event":"ALERT""#) {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
        assert_eq!(h.reconciler.get_local(BTC).await.side, PositionSide::Long);
        assert_eq!(h.coordinator.stats().await.conflicts, 3);
    }

    #[tokio::test]
    async fn test_low_confidence_open_blocked_by_risk() {
        let h = Harness::new(ScriptedModel::always(
            r#"{"action":"open_long","size":0.01,"leverage":10,"confidence":0.3}"#,
        ))
        .await;

        assert_eq!(h.cycle().await, SymbolOutcome::Held("open not approved".to_string()));
        assert_eq!(h.exchange.submitted_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejected_order_changes_nothing() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        h.exchange.reject_next("insufficient margin").await;

        let outcome = h.cycle().await;
        assert!(matches!(outcome, SymbolOutcome::Failed(reason) if reason.contains("insufficient margin")));
        assert!(!h.reconciler.get_local(BTC).await.is_open());
        assert_eq!(h.risk.status().await.consecutive_failures, 1);

        // cooldown หลัง failure → open รอบถัดไปถูกกั้น
        assert_eq!(h.cycle().await, SymbolOutcome::Held("open not approved".to_string()));
    }

    #[tokio::test]
    async fn test_unconfirmed_submit_adopted_from_exchange() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        h.exchange.fail_submits(2).await;

        assert!(matches!(h.cycle().await, SymbolOutcome::Failed(_)));
        assert_eq!(h.exchange.submitted_count().await, 0);

        // submit ไปถึง exchange จริงทั้งที่ฝั่งเราไม่ได้คำตอบ
        h.exchange.set_position(BTC, PositionSide::Long, 0.01, 50_010.0).await;
        assert_eq!(h.cycle().await, SymbolOutcome::Held("already positioned".to_string()));

        let local = h.reconciler.get_local(BTC).await;
        assert_eq!(local.side, PositionSide::Long);
        assert_eq!(local.entry_price, 50_010.0);
        assert_eq!(local.strategy, StrategyLabel::Balanced);
        assert!(!local.needs_attention);
    }

    #[tokio::test]
    async fn test_snapshot_unavailable_skips_symbol() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        h.snapshots.remove(BTC).await;

        assert!(matches!(h.cycle().await, SymbolOutcome::Skipped(_)));
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn test_busy_slot_skips_symbol() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        let _guard = h.coordinator.slots[BTC].lock().await;

        assert_eq!(h.cycle().await, SymbolOutcome::Busy);
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn test_cycle_deadline_abandons_pipeline() {
        let config = Config {
            cycle_deadline: Duration::from_millis(30),
            advisory_retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(5)),
            ..test_config()
        };
        let model = ScriptedModel::new(vec![Reply::Stall(Duration::from_millis(500))]);
        let h = Harness::build(config, model, Arc::new(JournalStore::in_memory())).await;

        assert!(matches!(h.cycle().await, SymbolOutcome::Failed(reason) if reason.contains("deadline")));
        assert_eq!(h.coordinator.stats().await.stages[BTC], Stage::Idle);
        assert_eq!(h.exchange.submitted_count().await, 0);
    }

    #[tokio::test]
    async fn test_adjust_moves_thresholds_only() {
        let h = Harness::new(ScriptedModel::new(vec![
            Reply::Text(OPEN_LONG.to_string()),
            Reply::Text(r#"{"action":"adjust_stop","stop_loss_pct":1.0,"confidence":0.6}"#.to_string()),
        ]))
        .await;
        h.cycle().await;

        assert_eq!(h.cycle().await, SymbolOutcome::Adjusted);
        let local = h.reconciler.get_local(BTC).await;
        assert_eq!(local.stop_loss_pct, Some(1.0));
        assert_eq!(local.take_profit_pct, Some(5.0));
        assert_eq!(h.exchange.submitted_count().await, 1);
    }
}
