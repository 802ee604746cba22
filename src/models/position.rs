//! # models::position
//!
//! [`Position`]: มุมมอง local ของ Position ต่อ symbol (มีได้แค่ 1 ต่อ symbol)
//! และ [`ClosedPosition`]: Position ที่ถูกปิดแล้ว พร้อมราคาออกและ P&L
//!
//! ## Ownership
//! Position เป็นของ Reconciler เท่านั้น: ที่อื่นได้แค่ clone ออกไปอ่าน
//! การแก้ไขทำผ่าน `reconcile_with_exchange` / `apply` / `adjust_thresholds`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::StrategyLabel;

// ─── Side ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    pub fn is_flat(self) -> bool {
        self == PositionSide::Flat
    }

    pub fn opposite(self) -> PositionSide {
        match self {
            PositionSide::Long  => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
            PositionSide::Flat  => PositionSide::Flat,
        }
    }

    /// +1 long / -1 short / 0 flat
    pub fn sign(self) -> f64 {
        match self {
            PositionSide::Long  => 1.0,
            PositionSide::Short => -1.0,
            PositionSide::Flat  => 0.0,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PositionSide::Long  => "long",
            PositionSide::Short => "short",
            PositionSide::Flat  => "flat",
        })
    }
}

// ─── Close Reason ─────────────────────────────────────────────────────────────

/// เหตุผลที่ Position ถูกปิด: ถูกบันทึกลง Memory Record ด้วย
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    /// Advisory แนะนำให้ปิด
    Advisory,
    /// ปิดเพื่อกลับฝั่ง (close-then-open)
    Reversal,
    /// Exchange รายงานว่า flat โดยที่ local ยังเปิดอยู่
    ExchangeClosed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::StopLoss       => "stop-loss",
            CloseReason::TakeProfit     => "take-profit",
            CloseReason::Advisory       => "advisory",
            CloseReason::Reversal       => "reversal",
            CloseReason::ExchangeClosed => "exchange-closed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id:     Uuid,
    pub symbol:          String,
    pub side:            PositionSide,
    pub entry_price:     f64,
    pub size:            f64,
    pub leverage:        u32,
    pub opened_at:       Option<DateTime<Utc>>,
    pub strategy:        StrategyLabel,
    /// % ขาดทุนของราคา (ไม่คูณ leverage) ที่จะตัดขาดทุน
    pub stop_loss_pct:   Option<f64>,
    pub take_profit_pct: Option<f64>,
    /// true = synthesize มาจาก exchange state รอ operator ตรวจสอบ
    pub needs_attention: bool,
    /// Mark price ล่าสุดที่เห็น (ใช้เป็นราคาปิดเมื่อ exchange ปิดเอง)
    pub last_mark_price: Option<f64>,
    /// ขนาดที่ถูกปิดไปแล้วแบบ partial (ยังไม่ได้บันทึก)
    #[serde(default)]
    pub closed_size:     f64,
    /// Σ size × exit ของ partial close สำหรับคิดราคาออกเฉลี่ย
    #[serde(default)]
    pub closed_notional: f64,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self {
            position_id:     Uuid::new_v4(),
            symbol:          symbol.to_string(),
            side:            PositionSide::Flat,
            entry_price:     0.0,
            size:            0.0,
            leverage:        1,
            opened_at:       None,
            strategy:        StrategyLabel::Unknown,
            stop_loss_pct:   None,
            take_profit_pct: None,
            needs_attention: false,
            last_mark_price: None,
            closed_size:     0.0,
            closed_notional: 0.0,
        }
    }

    /// ปิดบางส่วน: สะสมขนาดกับราคาออกไว้ Position ยังเปิดอยู่ด้วยขนาดที่เหลือ
    pub fn close_part(&mut self, size: f64, exit_price: f64, remaining: f64) {
        self.closed_size += size;
        self.closed_notional += size * exit_price;
        self.size = remaining;
        self.last_mark_price = Some(exit_price);
    }

    pub fn is_open(&self) -> bool {
        !self.side.is_flat()
    }

    /// Price-move P&L เป็น % เทียบ entry: long บวกเมื่อราคาขึ้น, short กลับด้าน
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if !self.is_open() || self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0 * self.side.sign()
    }

    /// เช็ค SL/TP ที่ mark price: SL ชนะถ้าถูกทั้งสองอย่าง (threshold ผิดรูป)
    pub fn threshold_hit(&self, mark: f64) -> Option<CloseReason> {
        if !self.is_open() || !mark.is_finite() || mark <= 0.0 {
            return None;
        }
        let pnl = self.pnl_pct(mark);
        if let Some(sl) = self.stop_loss_pct {
            if pnl <= -sl {
                return Some(CloseReason::StopLoss);
            }
        }
        if let Some(tp) = self.take_profit_pct {
            if pnl >= tp {
                return Some(CloseReason::TakeProfit);
            }
        }
        None
    }
}

// ─── Closed Position ──────────────────────────────────────────────────────────

/// Position ที่เพิ่งถูกปิด: ทุกตัวต้องกลายเป็น Memory Record หนึ่งรายการ
///
/// Partial close ก่อนหน้าถูกรวมเข้ามาที่นี่: size เป็นขนาดเต็มตอนเปิด และ
/// `exit_price` เป็นราคาออกเฉลี่ยถ่วงน้ำหนักตามขนาด
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedPosition {
    pub position:   Position,
    pub exit_price: f64,
    pub pnl_pct:    f64,
    pub reason:     CloseReason,
    pub closed_at:  DateTime<Utc>,
}

impl ClosedPosition {
    pub fn new(mut position: Position, exit_price: f64, reason: CloseReason) -> Self {
        let total = position.closed_size + position.size;
        let exit_price = if position.closed_size > 0.0 && total > 0.0 {
            (position.closed_notional + position.size * exit_price) / total
        } else {
            exit_price
        };
        position.size = total;
        position.closed_size = 0.0;
        position.closed_notional = 0.0;
        let pnl_pct = position.pnl_pct(exit_price);
        Self {
            position,
            exit_price,
            pnl_pct,
            reason,
            closed_at: Utc::now(),
        }
    }
}
