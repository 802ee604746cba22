//! # exchange::paper
//!
//! Paper exchange ในโปรเซส (`EXCHANGE_URL=mock`): จำลอง fill, position
//! และ mark price โดยไม่ต้องมี exchange จริง
//!
//! - Market order fill ทันทีที่ mark ปัจจุบัน (ยกเว้นเปิด `hold_orders`)
//! - Limit / Stop order ค้างเป็น `Working` จนกว่าจะ cancel
//! - dedupe ตาม `intent_id` (client order id)
//! - มี hook สำหรับจำลอง error: transient, reject, ปิด position จากภายนอก

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::Exchange;
use crate::error::TradeError;
use crate::models::{
    ExchangePosition, OrderIntent, OrderState, OrderStatus, OrderType, PositionSide,
};

const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone)]
struct PaperOrder {
    intent: OrderIntent,
    status: OrderStatus,
}

#[derive(Debug, Default)]
struct PaperBook {
    marks:             HashMap<String, f64>,
    /// signed size: + long, - short
    positions:         HashMap<String, (f64, f64)>,
    orders:            HashMap<String, PaperOrder>,
    by_client_id:      HashMap<Uuid, String>,
    next_order:        u64,
    submitted:         u64,
    transient_submits: u32,
    transient_queries: u32,
    reject_next:       Option<String>,
    hold_orders:       bool,
}

pub struct PaperExchange {
    book: Mutex<PaperBook>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self { book: Mutex::new(PaperBook::default()) }
    }

    pub async fn set_mark(&self, symbol: &str, price: f64) {
        self.book.lock().await.marks.insert(symbol.to_string(), price);
    }

    /// ตั้ง position ตรงๆ (จำลอง manual trade / state ก่อน restart)
    pub async fn set_position(&self, symbol: &str, side: PositionSide, size: f64, entry_price: f64) {
        let signed = size.abs() * side.sign();
        let mut book = self.book.lock().await;
        if signed.abs() < EPSILON {
            book.positions.remove(symbol);
        } else {
            book.positions.insert(symbol.to_string(), (signed, entry_price));
        }
    }

    /// จำลอง exchange ปิด position เอง (liquidation / SL ฝั่ง exchange)
    pub async fn close_externally(&self, symbol: &str) {
        self.book.lock().await.positions.remove(symbol);
    }

    /// `n` ครั้งถัดไปของ submit จะล้มแบบ transient
    pub async fn fail_submits(&self, n: u32) {
        self.book.lock().await.transient_submits = n;
    }

    /// `n` ครั้งถัดไปของ get_position / get_order_status จะล้มแบบ transient
    pub async fn fail_queries(&self, n: u32) {
        self.book.lock().await.transient_queries = n;
    }

    pub async fn reject_next(&self, reason: &str) {
        self.book.lock().await.reject_next = Some(reason.to_string());
    }

    /// true = order ใหม่ค้าง `Working` ไม่ fill
    pub async fn hold_orders(&self, hold: bool) {
        self.book.lock().await.hold_orders = hold;
    }

    /// Fill order ที่ค้างอยู่ทันที (ใช้คู่กับ `hold_orders`)
    pub async fn fill_working(&self, order_id: &str) {
        let mut book = self.book.lock().await;
        book.fill(order_id);
    }

    /// จำนวน order ที่ exchange รับจริง (ไม่นับ dedupe / reject)
    pub async fn submitted_count(&self) -> u64 {
        self.book.lock().await.submitted
    }

    pub async fn working_orders(&self, symbol: &str) -> usize {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.intent.symbol == symbol && !o.status.state.is_terminal())
            .count()
    }
}

impl PaperBook {
    fn take_query_failure(&mut self, call: &'static str) -> Result<(), TradeError> {
        if self.transient_queries > 0 {
            self.transient_queries -= 1;
            return Err(TradeError::ExchangeTransient { call, reason: "simulated outage".into() });
        }
        Ok(())
    }

    fn fill(&mut self, order_id: &str) {
        let Some(order) = self.orders.get(order_id).cloned() else {
            return;
        };
        if order.status.state.is_terminal() {
            return;
        }
        let symbol = order.intent.symbol.clone();
        let Some(price) = self.marks.get(&symbol).copied() else {
            return;
        };

        let (current, entry) = self.positions.get(&symbol).copied().unwrap_or((0.0, 0.0));
        let mut delta = order.intent.size * order.intent.side.sign();
        if order.intent.reduce_only {
            // reduce-only ลดได้ไม่เกินขนาดที่มี และต้องสวนทาง
            if current * delta >= 0.0 {
                delta = 0.0;
            } else if delta.abs() > current.abs() {
                delta = -current;
            }
        }
        let next = current + delta;

        if next.abs() < EPSILON {
            self.positions.remove(&symbol);
        } else if current.abs() < EPSILON || current.signum() != next.signum() {
            self.positions.insert(symbol.clone(), (next, price));
        } else if next.abs() > current.abs() {
            let weighted = (entry * current.abs() + price * delta.abs()) / next.abs();
            self.positions.insert(symbol.clone(), (next, weighted));
        } else {
            self.positions.insert(symbol.clone(), (next, entry));
        }

        if let Some(order) = self.orders.get_mut(order_id) {
            order.status = OrderStatus {
                state:          OrderState::Filled,
                filled_size:    delta.abs(),
                avg_fill_price: Some(price),
            };
        }
        info!(order_id, symbol = %symbol, price, "🎭 [PAPER] Order filled");
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn get_position(&self, symbol: &str) -> Result<ExchangePosition, TradeError> {
        let mut book = self.book.lock().await;
        book.take_query_failure("get_position")?;

        let mark = book.marks.get(symbol).copied().unwrap_or(0.0);
        Ok(match book.positions.get(symbol) {
            Some(&(signed, entry)) => ExchangePosition {
                symbol:      symbol.to_string(),
                side:        if signed > 0.0 { PositionSide::Long } else { PositionSide::Short },
                size:        signed.abs(),
                entry_price: entry,
                mark_price:  mark,
            },
            None => ExchangePosition::flat(symbol, mark),
        })
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<String, TradeError> {
        let mut book = self.book.lock().await;

        if let Some(existing) = book.by_client_id.get(&intent.intent_id) {
            return Ok(existing.clone());
        }
        if book.transient_submits > 0 {
            book.transient_submits -= 1;
            return Err(TradeError::ExchangeTransient {
                call:   "submit_order",
                reason: "simulated outage".into(),
            });
        }
        if let Some(reason) = book.reject_next.take() {
            return Err(TradeError::ExchangeRejected { call: "submit_order", reason });
        }
        if !(intent.size.is_finite() && intent.size > 0.0) {
            return Err(TradeError::ExchangeRejected {
                call:   "submit_order",
                reason: format!("invalid size {}", intent.size),
            });
        }
        if !book.marks.contains_key(&intent.symbol) {
            return Err(TradeError::ExchangeRejected {
                call:   "submit_order",
                reason: format!("no market for {}", intent.symbol),
            });
        }

        book.next_order += 1;
        book.submitted  += 1;
        let order_id = format!("paper-{}", book.next_order);
        book.by_client_id.insert(intent.intent_id, order_id.clone());
        book.orders.insert(
            order_id.clone(),
            PaperOrder {
                intent: intent.clone(),
                status: OrderStatus { state: OrderState::Working, filled_size: 0.0, avg_fill_price: None },
            },
        );

        if intent.order_type == OrderType::Market && !book.hold_orders {
            book.fill(&order_id);
        }
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, TradeError> {
        let mut book = self.book.lock().await;
        book.take_query_failure("get_order_status")?;
        book.orders
            .get(order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| TradeError::ExchangeRejected {
                call:   "get_order_status",
                reason: format!("unknown order {order_id}"),
            })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), TradeError> {
        let mut book = self.book.lock().await;
        let order = book.orders.get_mut(order_id).ok_or_else(|| TradeError::ExchangeRejected {
            call:   "cancel_order",
            reason: format!("unknown order {order_id}"),
        })?;
        if !order.status.state.is_terminal() {
            order.status.state = OrderState::Canceled;
        }
        Ok(())
    }
}
