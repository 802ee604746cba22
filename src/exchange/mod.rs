//! # exchange — Exchange Collaborator
//!
//! Interface แบบ opaque request/response ไปยัง exchange:
//! `get_position` · `submit_order` · `get_order_status` · `cancel_order`
//!
//! Error แบ่งเป็น 2 กลุ่ม:
//! - `ExchangeTransient`: network / rate limit / timeout → retry ด้วย [`with_retry`]
//! - `ExchangeRejected` : exchange ปฏิเสธ → terminal สำหรับ intent นั้น
//!
//! `submit_order` ส่ง `intent_id` เป็น client order id เสมอ exchange ต้อง
//! dedupe ด้วยค่านี้ การ retry submit จึงไม่เปิด order ซ้ำ

pub mod http;
pub mod paper;

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::TradeError;
use crate::models::{ExchangePosition, OrderIntent, OrderStatus};

pub use http::HttpExchange;
pub use paper::PaperExchange;

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_position(&self, symbol: &str) -> Result<ExchangePosition, TradeError>;

    /// คืน exchange order id
    async fn submit_order(&self, intent: &OrderIntent) -> Result<String, TradeError>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, TradeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), TradeError>;
}

// ─── Retry ────────────────────────────────────────────────────────────────────

/// เรียก `op` ภายใต้ timeout ต่อครั้ง: retry เฉพาะ transient error
/// ด้วย exponential backoff จนครบ `policy.attempts`
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    call: &'static str,
    symbol: &str,
    mut op: F,
) -> Result<T, TradeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TradeError>>,
{
    let mut attempt = 1;
    loop {
        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err))  => err,
            Err(_) => TradeError::ExchangeTransient {
                call,
                reason: format!("timed out after {:?}", policy.timeout),
            },
        };

        if !err.is_transient() || attempt >= policy.attempts {
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        warn!(
            symbol,
            call,
            attempt,
            max   = policy.attempts,
            error = %err,
            "🔁 Exchange call failed, retrying in {delay:?}"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
