//! # events
//!
//! [`WsEvent`]: ทุก Event ที่ trading loop broadcast ออกไปยัง `/ws/monitor`
//!
//! [`EventBus`] ห่อ `broadcast::Sender<String>` (JSON ที่ serialize แล้ว)
//! ไม่มี subscriber ก็ไม่ error: loop รันแบบ headless ได้

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ClosedPosition, OrderIntent, OrderState, Position};

/// ขนาด buffer ของ channel: client ที่อ่านช้ากว่านี้จะ lag
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent {
    CycleStarted {
        cycle:   u64,
        symbols: Vec<String>,
    },

    CycleFinished {
        cycle:       u64,
        duration_ms: u64,
    },

    /// Intent ถูกส่งให้ exchange แล้ว
    OrderSubmitted {
        order_id: String,
        intent:   Box<OrderIntent>,
    },

    /// Order ถึง terminal state
    OrderSettled {
        symbol:         String,
        order_id:       String,
        intent_id:      Uuid,
        state:          OrderState,
        filled_size:    f64,
        avg_fill_price: Option<f64>,
    },

    PositionOpened {
        position: Box<Position>,
    },

    PositionClosed {
        closed: Box<ClosedPosition>,
    },

    /// Exchange มี position ที่ระบบไม่รู้ที่มา
    PositionSynthesized {
        position: Box<Position>,
    },

    MemoryRecorded {
        symbol:  String,
        outcome: String,
        pnl_pct: f64,
        lesson:  String,
    },

    ReconciliationConflict {
        symbol:      String,
        local:       String,
        exchange:    String,
        consecutive: u32,
    },

    /// Process-level alert (store ล่ม / conflict ซ้ำ)
    Alert {
        symbol:  Option<String>,
        kind:    String,
        message: String,
    },

    RiskKilled {
        reason: String,
    },

    Draining,
}

impl WsEvent {
    /// แปลงเป็น JSON String สำหรับส่งผ่าน WebSocket
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: &WsEvent) {
        // Err = ไม่มี receiver
        let _ = self.tx.send(event.to_json());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}
