//! # reconciler — Position Reconciler
//!
//! มุมมอง local ที่เชื่อถือได้ของ Position ต่อ symbol และกติกาการ diff กับ
//! state ที่ exchange รายงาน
//!
//! ## Authority
//! | Field                              | Authoritative |
//! |------------------------------------|---------------|
//! | side · size · entry price          | exchange      |
//! | strategy · thresholds · opened-at  | local (เมื่อ side ตรงกัน) |
//!
//! ## Table
//! `RwLock<HashMap<symbol, Arc<Mutex<Position>>>>`: write lock ของ map ใช้แค่
//! ตอนเพิ่ม symbol ใหม่ การแก้ Position ล็อคเฉพาะ symbol นั้น (ไม่มี cross-symbol lock)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TradeError;
use crate::models::{
    ClosedPosition, CloseReason, ExchangePosition, FillResult, IntentPurpose, OrderIntent,
    Position, PositionSide, StrategyLabel,
};

/// Tolerance สำหรับเทียบ size / entry ที่ exchange ปัดเศษมา
const REL_TOLERANCE: f64 = 1e-9;

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reconciliation {
    /// ตรงกันอยู่แล้ว (mark price อาจถูกอัปเดต)
    Unchanged { position: Position },
    /// side ตรงกัน แต่ size / entry เปลี่ยนตาม exchange
    Refreshed { position: Position },
    /// Open intent ของระบบเองที่ fill ไปแล้วโดยที่ local ยังไม่รู้
    Adopted { position: Position },
    /// Exchange มี position ที่ระบบไม่รู้ที่มา: ต้องให้ operator ดู
    Synthesized { position: Position },
    /// Exchange flat แต่ local ยังเปิด
    ExchangeClosed { closed: ClosedPosition },
    /// Reversal ของระบบเองที่ fill ไปแล้ว: ปิดฝั่งเดิม เปิดฝั่งใหม่
    Reversed { closed: ClosedPosition, position: Position },
}

impl Reconciliation {
    /// Position local หลัง reconcile
    pub fn position(&self) -> Position {
        match self {
            Reconciliation::Unchanged { position }
            | Reconciliation::Refreshed { position }
            | Reconciliation::Adopted { position }
            | Reconciliation::Synthesized { position }
            | Reconciliation::Reversed { position, .. } => position.clone(),
            Reconciliation::ExchangeClosed { closed } => Position::flat(&closed.position.symbol),
        }
    }

    pub fn closed(&self) -> Option<&ClosedPosition> {
        match self {
            Reconciliation::ExchangeClosed { closed } | Reconciliation::Reversed { closed, .. } => {
                Some(closed)
            }
            _ => None,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Reconciliation::Unchanged { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Reconciliation::Unchanged { .. }      => "unchanged",
            Reconciliation::Refreshed { .. }      => "refreshed",
            Reconciliation::Adopted { .. }        => "adopted",
            Reconciliation::Synthesized { .. }    => "synthesized",
            Reconciliation::ExchangeClosed { .. } => "exchange_closed",
            Reconciliation::Reversed { .. }       => "reversed",
        }
    }
}

/// ผลของ `apply`: Position ใหม่ และ Position ที่ถูกปิด (ถ้ามี)
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub position: Position,
    pub closed:   Option<ClosedPosition>,
}

// ─── Reconciler ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PositionReconciler {
    table: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
}

impl PositionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, symbol: &str) -> Arc<Mutex<Position>> {
        if let Some(entry) = self.table.read().await.get(symbol) {
            return Arc::clone(entry);
        }
        let mut table = self.table.write().await;
        Arc::clone(
            table
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Position::flat(symbol)))),
        )
    }

    pub async fn get_local(&self, symbol: &str) -> Position {
        self.entry(symbol).await.lock().await.clone()
    }

    /// ทุก symbol ที่เคยเห็น เรียงตามชื่อ
    pub async fn all(&self) -> Vec<Position> {
        let entries: Vec<_> = self.table.read().await.values().cloned().collect();
        let mut positions = Vec::with_capacity(entries.len());
        for entry in entries {
            positions.push(entry.lock().await.clone());
        }
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    // ─── Reconcile ────────────────────────────────────────────────────────────

    /// Diff local กับ exchange: `in_flight` คือ intent ล่าสุดของระบบที่ยัง
    /// ไม่ได้ apply (resolve มาจากรอบก่อน) ใช้อธิบายการเปลี่ยน side
    pub async fn reconcile_with_exchange(
        &self,
        symbol: &str,
        reported: &ExchangePosition,
        in_flight: Option<&OrderIntent>,
    ) -> Result<Reconciliation, TradeError> {
        let entry = self.entry(symbol).await;
        let mut local = entry.lock().await;
        let mark = reported.mark();

        let result = match (local.side, reported.side) {
            // ── ทั้งคู่ flat ──────────────────────────────────────────────────
            (PositionSide::Flat, PositionSide::Flat) => {
                if let Some(mark) = mark {
                    local.last_mark_price = Some(mark);
                }
                Reconciliation::Unchanged { position: local.clone() }
            }

            // ── Exchange มี, local ไม่มี ──────────────────────────────────────
            (PositionSide::Flat, side) => match in_flight.filter(|i| opens_side(i, side)) {
                Some(intent) => {
                    *local = position_from_intent(intent, reported);
                    info!(symbol, side = %side, "📥 Adopted filled open from exchange state");
                    Reconciliation::Adopted { position: local.clone() }
                }
                None => {
                    *local = synthesize(reported);
                    warn!(
                        symbol,
                        side  = %side,
                        size  = reported.size,
                        entry = reported.entry_price,
                        "🧩 Unknown exchange position synthesized, needs operator attention"
                    );
                    Reconciliation::Synthesized { position: local.clone() }
                }
            },

            // ── Local มี, exchange flat ───────────────────────────────────────
            (_, PositionSide::Flat) => {
                let reason = in_flight
                    .filter(|i| i.purpose == IntentPurpose::Close)
                    .and_then(|i| i.close_reason)
                    .unwrap_or(CloseReason::ExchangeClosed);
                let exit = mark
                    .or(local.last_mark_price)
                    .unwrap_or(local.entry_price);
                let closed = ClosedPosition::new(local.clone(), exit, reason);
                *local = Position::flat(symbol);
                local.last_mark_price = mark;
                info!(symbol, reason = %reason, exit, pnl_pct = closed.pnl_pct, "📤 Local position closed from exchange state");
                Reconciliation::ExchangeClosed { closed }
            }

            // ── side ตรงกัน ───────────────────────────────────────────────────
            (local_side, side) if local_side == side => {
                if let Some(mark) = mark {
                    local.last_mark_price = Some(mark);
                }
                if approx_eq(local.size, reported.size) && approx_eq(local.entry_price, reported.entry_price) {
                    Reconciliation::Unchanged { position: local.clone() }
                } else {
                    local.size        = reported.size;
                    local.entry_price = reported.entry_price;
                    Reconciliation::Refreshed { position: local.clone() }
                }
            }

            // ── side พลิก ─────────────────────────────────────────────────────
            (local_side, side) => match in_flight.filter(|i| opens_side(i, side)) {
                Some(intent) => {
                    let exit = mark.or(local.last_mark_price).unwrap_or(reported.entry_price);
                    let closed = ClosedPosition::new(local.clone(), exit, CloseReason::Reversal);
                    *local = position_from_intent(intent, reported);
                    Reconciliation::Reversed { closed, position: local.clone() }
                }
                None => {
                    return Err(TradeError::ReconciliationConflict {
                        symbol:   symbol.to_string(),
                        local:    local_side,
                        exchange: side,
                    });
                }
            },
        };

        Ok(result)
    }

    // ─── Apply Fill ───────────────────────────────────────────────────────────

    /// เรียกหลัง exchange ยืนยัน fill เท่านั้น
    pub async fn apply(
        &self,
        symbol: &str,
        intent: &OrderIntent,
        fill: &FillResult,
    ) -> Result<Applied, TradeError> {
        if intent.symbol != symbol {
            return Err(TradeError::InvalidInput(format!(
                "intent for {} applied to {symbol}",
                intent.symbol
            )));
        }
        if !(fill.filled_size > 0.0 && fill.avg_fill_price > 0.0) {
            return Err(TradeError::InvalidInput(format!(
                "fill {} has no executed quantity",
                fill.order_id
            )));
        }

        let entry = self.entry(symbol).await;
        let mut local = entry.lock().await;

        match intent.purpose {
            IntentPurpose::Open => {
                let target = intent.target_side();
                if local.is_open() && local.side != target {
                    return Err(TradeError::InvalidInput(format!(
                        "open {target} on {symbol} while local is {}",
                        local.side
                    )));
                }
                if local.is_open() {
                    // เพิ่มขนาดฝั่งเดิม: entry เฉลี่ยถ่วงน้ำหนัก
                    let total = local.size + fill.filled_size;
                    local.entry_price =
                        (local.entry_price * local.size + fill.avg_fill_price * fill.filled_size) / total;
                    local.size = total;
                } else {
                    let reported = ExchangePosition {
                        symbol:      symbol.to_string(),
                        side:        target,
                        size:        fill.filled_size,
                        entry_price: fill.avg_fill_price,
                        mark_price:  fill.avg_fill_price,
                    };
                    *local = position_from_intent(intent, &reported);
                }
                Ok(Applied { position: local.clone(), closed: None })
            }
            IntentPurpose::Close => {
                if !local.is_open() {
                    return Err(TradeError::InvalidInput(format!(
                        "close fill on {symbol} while local is flat"
                    )));
                }
                let reason = intent.close_reason.unwrap_or(CloseReason::Advisory);
                let remaining = local.size - fill.filled_size;

                if remaining > local.size * REL_TOLERANCE && !approx_eq(remaining, 0.0) {
                    // partial close: Position ยังเปิดด้วยขนาดที่เหลือ บันทึกครั้งเดียวตอน flat
                    local.close_part(fill.filled_size, fill.avg_fill_price, remaining);
                    Ok(Applied { position: local.clone(), closed: None })
                } else {
                    let closed = ClosedPosition::new(local.clone(), fill.avg_fill_price, reason);
                    *local = Position::flat(symbol);
                    local.last_mark_price = Some(fill.avg_fill_price);
                    Ok(Applied { position: local.clone(), closed: Some(closed) })
                }
            }
        }
    }

    // ─── Local-only Mutations ─────────────────────────────────────────────────

    /// ปรับ SL/TP ของ Position ที่เปิดอยู่ (ไม่ส่ง order)
    pub async fn adjust_thresholds(
        &self,
        symbol: &str,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
    ) -> Result<Position, TradeError> {
        let entry = self.entry(symbol).await;
        let mut local = entry.lock().await;
        if !local.is_open() {
            return Err(TradeError::InvalidInput(format!("no open position on {symbol}")));
        }
        if stop_loss_pct.is_some() {
            local.stop_loss_pct = stop_loss_pct;
        }
        if take_profit_pct.is_some() {
            local.take_profit_pct = take_profit_pct;
        }
        Ok(local.clone())
    }

    /// Operator รับทราบ Position ที่ synthesize มา
    pub async fn acknowledge(&self, symbol: &str) -> Position {
        let entry = self.entry(symbol).await;
        let mut local = entry.lock().await;
        local.needs_attention = false;
        local.clone()
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= REL_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

fn opens_side(intent: &OrderIntent, side: PositionSide) -> bool {
    intent.purpose == IntentPurpose::Open && intent.target_side() == side
}

fn position_from_intent(intent: &OrderIntent, reported: &ExchangePosition) -> Position {
    Position {
        position_id:     Uuid::new_v4(),
        symbol:          reported.symbol.clone(),
        side:            reported.side,
        entry_price:     reported.entry_price,
        size:            reported.size,
        leverage:        intent.leverage,
        opened_at:       Some(Utc::now()),
        strategy:        intent.strategy,
        stop_loss_pct:   intent.stop_loss_pct,
        take_profit_pct: intent.take_profit_pct,
        needs_attention: false,
        last_mark_price: reported.mark(),
        closed_size:     0.0,
        closed_notional: 0.0,
    }
}

fn synthesize(reported: &ExchangePosition) -> Position {
    Position {
        position_id:     Uuid::new_v4(),
        symbol:          reported.symbol.clone(),
        side:            reported.side,
        entry_price:     reported.entry_price,
        size:            reported.size,
        leverage:        1,
        opened_at:       None,
        strategy:        StrategyLabel::Unknown,
        stop_loss_pct:   None,
        take_profit_pct: None,
        needs_attention: true,
        last_mark_price: reported.mark(),
        closed_size:     0.0,
        closed_notional: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: &str = "BTC/USDT";

    fn reported(side: PositionSide, size: f64, entry: f64, mark: f64) -> ExchangePosition {
        ExchangePosition { symbol: BTC.into(), side, size, entry_price: entry, mark_price: mark }
    }

    fn open_long() -> OrderIntent {
        OrderIntent::open(BTC, PositionSide::Long, 0.01, 10, StrategyLabel::Balanced, Some(2.0), Some(5.0))
    }

    fn fill(size: f64, price: f64) -> FillResult {
        FillResult { order_id: "o-1".into(), filled_size: size, avg_fill_price: price }
    }

    async fn with_long() -> PositionReconciler {
        let rec = PositionReconciler::new();
        rec.apply(BTC, &open_long(), &fill(0.01, 50_000.0)).await.unwrap();
        rec
    }

    #[tokio::test]
    async fn test_apply_open_sets_local_fields() {
        let rec = with_long().await;
        let pos = rec.get_local(BTC).await;
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.entry_price, 50_000.0);
        assert_eq!(pos.strategy, StrategyLabel::Balanced);
        assert_eq!(pos.stop_loss_pct, Some(2.0));
        assert!(pos.opened_at.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let rec = with_long().await;
        let report = reported(PositionSide::Long, 0.01, 50_100.0, 50_200.0);

        let first = rec.reconcile_with_exchange(BTC, &report, None).await.unwrap();
        assert_eq!(first.label(), "refreshed");
        let after_first = rec.get_local(BTC).await;

        let second = rec.reconcile_with_exchange(BTC, &report, None).await.unwrap();
        assert_eq!(second.label(), "unchanged");
        assert_eq!(rec.get_local(BTC).await, after_first);
    }

    #[tokio::test]
    async fn test_local_metadata_kept_when_sides_match() {
        let rec = with_long().await;
        let opened_at = rec.get_local(BTC).await.opened_at;
        rec.reconcile_with_exchange(BTC, &reported(PositionSide::Long, 0.02, 49_000.0, 49_500.0), None)
            .await
            .unwrap();
        let pos = rec.get_local(BTC).await;
        assert_eq!(pos.size, 0.02);
        assert_eq!(pos.entry_price, 49_000.0);
        assert_eq!(pos.strategy, StrategyLabel::Balanced);
        assert_eq!(pos.take_profit_pct, Some(5.0));
        assert_eq!(pos.opened_at, opened_at);
    }

    #[tokio::test]
    async fn test_unknown_exchange_position_is_synthesized() {
        let rec = PositionReconciler::new();
        let result = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Short, 0.5, 51_000.0, 50_900.0), None)
            .await
            .unwrap();
        assert_eq!(result.label(), "synthesized");
        let pos = rec.get_local(BTC).await;
        assert_eq!(pos.strategy, StrategyLabel::Unknown);
        assert!(pos.stop_loss_pct.is_none() && pos.take_profit_pct.is_none());
        assert!(pos.needs_attention);

        assert!(!rec.acknowledge(BTC).await.needs_attention);
    }

    #[tokio::test]
    async fn test_in_flight_open_is_adopted() {
        let rec = PositionReconciler::new();
        let intent = open_long();
        let result = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Long, 0.01, 50_010.0, 50_020.0), Some(&intent))
            .await
            .unwrap();
        assert_eq!(result.label(), "adopted");
        let pos = rec.get_local(BTC).await;
        assert_eq!(pos.strategy, StrategyLabel::Balanced);
        assert!(!pos.needs_attention);
    }

    #[tokio::test]
    async fn test_exchange_closed_uses_mark_and_tags_reason() {
        let rec = with_long().await;
        let result = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Flat, 0.0, 0.0, 51_000.0), None)
            .await
            .unwrap();
        let closed = result.closed().cloned().unwrap();
        assert_eq!(closed.reason, CloseReason::ExchangeClosed);
        assert_eq!(closed.exit_price, 51_000.0);
        assert!((closed.pnl_pct - 2.0).abs() < 1e-9);
        assert_eq!(rec.get_local(BTC).await.side, PositionSide::Flat);
    }

    #[tokio::test]
    async fn test_exchange_closed_falls_back_to_last_mark() {
        let rec = with_long().await;
        rec.reconcile_with_exchange(BTC, &reported(PositionSide::Long, 0.01, 50_000.0, 49_000.0), None)
            .await
            .unwrap();
        let result = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Flat, 0.0, 0.0, 0.0), None)
            .await
            .unwrap();
        assert_eq!(result.closed().unwrap().exit_price, 49_000.0);
    }

    #[tokio::test]
    async fn test_side_flip_without_intent_is_conflict() {
        let rec = with_long().await;
        let before = rec.get_local(BTC).await;
        let err = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Short, 0.01, 50_000.0, 50_000.0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "reconciliation_conflict");
        assert_eq!(rec.get_local(BTC).await, before);
    }

    #[tokio::test]
    async fn test_side_flip_with_reversal_intent() {
        let rec = with_long().await;
        let reverse = OrderIntent::open(BTC, PositionSide::Short, 0.01, 10, StrategyLabel::Aggressive, None, None);
        let result = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Short, 0.01, 49_000.0, 49_000.0), Some(&reverse))
            .await
            .unwrap();
        assert_eq!(result.label(), "reversed");
        assert_eq!(result.closed().unwrap().reason, CloseReason::Reversal);
        assert_eq!(rec.get_local(BTC).await.strategy, StrategyLabel::Aggressive);
    }

    #[tokio::test]
    async fn test_apply_close_returns_closed_position() {
        let rec = with_long().await;
        let local = rec.get_local(BTC).await;
        let close = OrderIntent::close(&local, CloseReason::StopLoss);
        let applied = rec.apply(BTC, &close, &fill(0.01, 48_750.0)).await.unwrap();

        assert_eq!(applied.position.side, PositionSide::Flat);
        let closed = applied.closed.unwrap();
        assert_eq!(closed.reason, CloseReason::StopLoss);
        assert!((closed.pnl_pct + 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_remainder_open() {
        let rec = with_long().await;
        let close = OrderIntent::close(&rec.get_local(BTC).await, CloseReason::Advisory);
        let applied = rec.apply(BTC, &close, &fill(0.004, 51_000.0)).await.unwrap();
        assert_eq!(applied.position.side, PositionSide::Long);
        assert!((applied.position.size - 0.006).abs() < 1e-12);
        assert_eq!(applied.closed, None);
    }

    #[tokio::test]
    async fn test_full_close_after_partial_yields_one_closed_position() {
        let rec = with_long().await;
        let close = OrderIntent::close(&rec.get_local(BTC).await, CloseReason::Advisory);
        assert!(rec.apply(BTC, &close, &fill(0.004, 51_000.0)).await.unwrap().closed.is_none());

        let close = OrderIntent::close(&rec.get_local(BTC).await, CloseReason::Advisory);
        let applied = rec.apply(BTC, &close, &fill(0.006, 52_000.0)).await.unwrap();
        assert_eq!(applied.position.side, PositionSide::Flat);
        let closed = applied.closed.unwrap();
        assert!((closed.position.size - 0.01).abs() < 1e-12);
        assert!((closed.exit_price - 51_600.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_exchange_close_after_partial_keeps_full_size() {
        let rec = with_long().await;
        let close = OrderIntent::close(&rec.get_local(BTC).await, CloseReason::Advisory);
        rec.apply(BTC, &close, &fill(0.004, 51_000.0)).await.unwrap();

        let result = rec
            .reconcile_with_exchange(BTC, &reported(PositionSide::Flat, 0.0, 0.0, 52_000.0), None)
            .await
            .unwrap();
        let closed = result.closed().unwrap();
        assert_eq!(closed.reason, CloseReason::ExchangeClosed);
        assert!((closed.position.size - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_adjust_requires_open_position() {
        let rec = PositionReconciler::new();
        assert!(rec.adjust_thresholds(BTC, Some(1.0), None).await.is_err());

        let rec = with_long().await;
        let pos = rec.adjust_thresholds(BTC, Some(1.0), None).await.unwrap();
        assert_eq!(pos.stop_loss_pct, Some(1.0));
        assert_eq!(pos.take_profit_pct, Some(5.0));
    }
}
