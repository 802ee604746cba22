//! # coordinator::planner
//!
//! แปลง Recommendation + Position ปัจจุบันเป็น net action ของรอบนี้
//! Reversal = close ก่อน แล้วค่อย open (สอง intent ตามลำดับ)

use crate::models::{Action, CloseReason, OrderIntent, Position, Recommendation, StrategyLabel};

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// ไม่มีอะไรต้องทำ: เหตุผลสั้นๆ สำหรับ log
    Nothing(&'static str),
    /// ปรับ SL/TP ใน local เท่านั้น
    Adjust {
        stop_loss_pct:   Option<f64>,
        take_profit_pct: Option<f64>,
    },
    /// ส่งตามลำดับ: ตัวถัดไปส่งได้เมื่อตัวก่อนหน้า fill แล้วเท่านั้น
    Orders(Vec<OrderIntent>),
}

pub fn plan(rec: &Recommendation, position: &Position, strategy: StrategyLabel) -> Plan {
    match &rec.action {
        Action::Hold              => Plan::Nothing("hold"),
        Action::Invalid { .. }    => Plan::Nothing("invalid advice"),

        Action::Close { reason } => {
            if position.is_open() {
                Plan::Orders(vec![OrderIntent::close(position, *reason)])
            } else {
                Plan::Nothing("nothing to close")
            }
        }

        Action::Adjust { stop_loss_pct, take_profit_pct } => {
            if position.is_open() {
                Plan::Adjust { stop_loss_pct: *stop_loss_pct, take_profit_pct: *take_profit_pct }
            } else {
                Plan::Nothing("no position to adjust")
            }
        }

        Action::Open { side, size, leverage, stop_loss_pct, take_profit_pct } => {
            if position.side == *side {
                return Plan::Nothing("already positioned");
            }

            let profile = strategy.profile();
            let open = OrderIntent::open(
                &rec.symbol,
                *side,
                *size,
                *leverage,
                strategy,
                stop_loss_pct.or(profile.map(|p| p.stop_loss_pct)),
                take_profit_pct.or(profile.map(|p| p.take_profit_pct)),
            );

            if position.is_open() {
                Plan::Orders(vec![OrderIntent::close(position, CloseReason::Reversal), open])
            } else {
                Plan::Orders(vec![open])
            }
        }
    }
}
