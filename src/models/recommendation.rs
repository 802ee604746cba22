//! # models::recommendation
//!
//! คำแนะนำจาก Advisory Engine: immutable หลังสร้าง
//!
//! `Action` เป็น tagged union ที่ผ่าน validation แล้ว: downstream ต้อง match
//! ครบทุกกรณี และ `Invalid` ถูกปฏิบัติเหมือน hold เสมอ

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CloseReason, PositionSide};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Open {
        side:            PositionSide,
        size:            f64,
        leverage:        u32,
        stop_loss_pct:   Option<f64>,
        take_profit_pct: Option<f64>,
    },
    Close {
        reason: CloseReason,
    },
    Hold,
    Adjust {
        stop_loss_pct:   Option<f64>,
        take_profit_pct: Option<f64>,
    },
    /// คำตอบจาก model ไม่ผ่าน validation: มีค่าเท่ากับ hold
    Invalid {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub symbol:      String,
    pub action:      Action,
    /// 0.0..=1.0
    pub confidence:  f64,
    pub rationale:   String,
    pub produced_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn new(symbol: &str, action: Action, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            action,
            confidence,
            rationale: rationale.into(),
            produced_at: Utc::now(),
        }
    }

    pub fn hold(symbol: &str, rationale: impl Into<String>) -> Self {
        Self::new(symbol, Action::Hold, 0.0, rationale)
    }

    pub fn invalid(symbol: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(symbol, Action::Invalid { reason: reason.clone() }, 0.0, reason)
    }

    /// Close ที่เกิดจาก SL/TP guard (ไม่ผ่าน Advisory)
    pub fn threshold_close(symbol: &str, reason: CloseReason, pnl_pct: f64) -> Self {
        Self::new(
            symbol,
            Action::Close { reason },
            1.0,
            format!("{reason} triggered at {pnl_pct:+.2}%"),
        )
    }

    /// Hold หรือ Invalid: ไม่มี order action
    pub fn is_hold(&self) -> bool {
        matches!(self.action, Action::Hold | Action::Invalid { .. })
    }

    /// ชื่อ action สั้นๆ สำหรับ log / event
    pub fn label(&self) -> &'static str {
        match &self.action {
            Action::Open { side: PositionSide::Short, .. } => "open_short",
            Action::Open { .. }                            => "open_long",
            Action::Close { .. }                           => "close",
            Action::Hold                                   => "hold",
            Action::Adjust { .. }                          => "adjust_stop",
            Action::Invalid { .. }                         => "invalid",
        }
    }
}
