//! # models::order
//!
//! Order Intent และผลตอบกลับจาก Exchange
//!
//! `OrderIntent` ถูกสร้างโดย Coordinator ใช้ได้ครั้งเดียว และไม่ถูก persist
//! เลยรอบ cycle ที่สร้างมัน (ยกเว้นเป็น pending ที่รอ resolve รอบถัดไป)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CloseReason, Position, PositionSide, StrategyLabel};

// ─── Direction / Type ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 buy / -1 sell
    pub fn sign(self) -> f64 {
        match self {
            OrderSide::Buy  => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

/// Coordinator ส่ง `Market` และ `Limit` (open เมื่อตั้ง `ENTRY_LIMIT_OFFSET_PCT`)
/// `Stop` มีไว้ตาม contract ของ exchange bridge เท่านั้น: SL/TP ปิดด้วย market
/// หลังเช็คที่ mark price ทุก cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit { price: f64 },
    Stop { trigger: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentPurpose {
    Open,
    Close,
}

// ─── Order Intent ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderIntent {
    /// ใช้เป็น client order id: exchange ใช้ dedupe การ submit ซ้ำ
    pub intent_id:       Uuid,
    pub symbol:          String,
    pub side:            OrderSide,
    pub size:            f64,
    pub order_type:      OrderType,
    pub leverage:        u32,
    pub purpose:         IntentPurpose,
    pub reduce_only:     bool,
    /// Position ที่ intent นี้จะปิด (None = เปิดใหม่)
    pub position_id:     Option<Uuid>,
    pub strategy:        StrategyLabel,
    pub stop_loss_pct:   Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub close_reason:    Option<CloseReason>,
    pub created_at:      DateTime<Utc>,
}

impl OrderIntent {
    /// Market order เปิด Position ใหม่ฝั่ง `side`
    pub fn open(
        symbol: &str,
        side: PositionSide,
        size: f64,
        leverage: u32,
        strategy: StrategyLabel,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
    ) -> Self {
        Self {
            intent_id:  Uuid::new_v4(),
            symbol:     symbol.to_string(),
            side:       if side == PositionSide::Short { OrderSide::Sell } else { OrderSide::Buy },
            size,
            order_type: OrderType::Market,
            leverage,
            purpose:    IntentPurpose::Open,
            reduce_only: false,
            position_id: None,
            strategy,
            stop_loss_pct,
            take_profit_pct,
            close_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Reduce-only market order ปิด Position ทั้งก้อน
    pub fn close(position: &Position, reason: CloseReason) -> Self {
        Self {
            intent_id:  Uuid::new_v4(),
            symbol:     position.symbol.clone(),
            side:       if position.side == PositionSide::Short { OrderSide::Buy } else { OrderSide::Sell },
            size:       position.size,
            order_type: OrderType::Market,
            leverage:   position.leverage,
            purpose:    IntentPurpose::Close,
            reduce_only: true,
            position_id: Some(position.position_id),
            strategy:   position.strategy,
            stop_loss_pct:   None,
            take_profit_pct: None,
            close_reason: Some(reason),
            created_at: Utc::now(),
        }
    }

    /// เปลี่ยน open เป็น limit ที่ห่างจาก mark `offset_pct` % ไปทางที่ได้เปรียบ
    /// (buy ต่ำกว่า, sell สูงกว่า): close ยังเป็น market เสมอ
    pub fn limit_entry(mut self, mark: f64, offset_pct: f64) -> Self {
        if self.purpose == IntentPurpose::Open && offset_pct > 0.0 && mark.is_finite() && mark > 0.0 {
            let price = mark * (1.0 - self.side.sign() * offset_pct / 100.0);
            self.order_type = OrderType::Limit { price };
        }
        self
    }

    /// ฝั่งของ Position หลังจาก intent นี้ fill ครบ
    pub fn target_side(&self) -> PositionSide {
        match (self.purpose, self.side) {
            (IntentPurpose::Close, _)              => PositionSide::Flat,
            (IntentPurpose::Open, OrderSide::Buy)  => PositionSide::Long,
            (IntentPurpose::Open, OrderSide::Sell) => PositionSide::Short,
        }
    }
}

// ─── Exchange Results ─────────────────────────────────────────────────────────

/// สถานะ order ฝั่ง exchange
///
/// Terminal: `Filled`, `PartiallyFilled` (exchange ยุติ order แล้วโดย fill ไม่ครบ),
/// `Rejected`, `Canceled`: ระหว่างยัง fill อยู่ exchange จะรายงานเป็น `Working`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Working,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::PartiallyFilled
                | OrderState::Rejected
                | OrderState::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state:          OrderState,
    pub filled_size:    f64,
    pub avg_fill_price: Option<f64>,
}

/// Fill ที่ยืนยันแล้ว: input ของ `PositionReconciler::apply`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillResult {
    pub order_id:       String,
    pub filled_size:    f64,
    pub avg_fill_price: f64,
}

/// Position ตามที่ exchange รายงาน (authoritative สำหรับ side / size / entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol:      String,
    pub side:        PositionSide,
    pub size:        f64,
    pub entry_price: f64,
    /// 0.0 = exchange ไม่ได้ส่ง mark มา
    #[serde(default)]
    pub mark_price:  f64,
}

impl ExchangePosition {
    pub fn flat(symbol: &str, mark_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: 0.0,
            mark_price,
        }
    }

    pub fn mark(&self) -> Option<f64> {
        (self.mark_price.is_finite() && self.mark_price > 0.0).then_some(self.mark_price)
    }
}
