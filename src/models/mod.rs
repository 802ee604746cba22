//! Domain models shared across the whole trading loop.

pub mod memory;
pub mod order;
pub mod position;
pub mod recommendation;
pub mod snapshot;
pub mod strategy;

pub use memory::{Insight, MemoryQuery, MemoryRecord, Outcome, StrategyStats};
pub use order::{
    ExchangePosition, FillResult, IntentPurpose, OrderIntent, OrderSide, OrderState, OrderStatus,
    OrderType,
};
pub use position::{ClosedPosition, CloseReason, Position, PositionSide};
pub use recommendation::{Action, Recommendation};
pub use snapshot::{MarketRegime, MarketSnapshot};
pub use strategy::{StrategyLabel, StrategyProfile};
