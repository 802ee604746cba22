//! # state
//!
//! Shared state ของ monitor / control API: ทุกอย่างเป็น handle ที่ share
//! กับ Coordinator (ไม่มี global) inject เข้า handler ผ่าน `State<SharedState>`

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::coordinator::Coordinator;
use crate::events::EventBus;
use crate::memory::MemoryStore;
use crate::reconciler::PositionReconciler;
use crate::risk::RiskManager;

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub reconciler:  Arc<PositionReconciler>,
    pub memory:      Arc<dyn MemoryStore>,
    pub risk:        Arc<RiskManager>,
    pub events:      EventBus,
    /// `None` = dev mode ไม่ตรวจ `X-API-Key`
    pub api_key:     Option<String>,
    pub started_at:  DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        reconciler: Arc<PositionReconciler>,
        risk: Arc<RiskManager>,
        events: EventBus,
        api_key: Option<String>,
    ) -> SharedState {
        Arc::new(Self {
            memory: Arc::clone(coordinator.memory()),
            coordinator,
            reconciler,
            risk,
            events,
            api_key: api_key.filter(|k| !k.is_empty()),
            started_at: Utc::now(),
        })
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.coordinator.config().symbols.iter().any(|s| s == symbol)
    }
}
