//! # exchange::http
//!
//! **Exchange Bridge Client**: ส่ง order ไปยัง exchange bridge ผ่าน HTTP
//!
//! ## Bridge API Contract
//! | Method | Path                    | Body / Response                                  |
//! |--------|-------------------------|--------------------------------------------------|
//! | GET    | `/position?symbol=`     | → `ExchangePosition`                             |
//! | POST   | `/order`                | `BridgeOrderRequest` → `{ ok, order_id, reason }` |
//! | GET    | `/order/{id}`           | → `OrderStatus`                                  |
//! | DELETE | `/order/{id}`           | → `{ ok, reason }`                               |
//!
//! HTTP 4xx (ยกเว้น 408 / 429) = rejected, ที่เหลือ = transient

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::Exchange;
use crate::error::TradeError;
use crate::models::{ExchangePosition, OrderIntent, OrderSide, OrderStatus, OrderType};

// ─── Bridge Request / Response ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BridgeOrderRequest<'a> {
    /// dedupe key: submit ซ้ำด้วย id เดิมต้องได้ order เดิม
    pub client_order_id: Uuid,
    pub symbol:          &'a str,
    pub side:            OrderSide,
    pub size:            f64,
    #[serde(flatten)]
    pub order_type:      OrderType,
    pub leverage:        u32,
    pub reduce_only:     bool,
}

impl<'a> From<&'a OrderIntent> for BridgeOrderRequest<'a> {
    fn from(intent: &'a OrderIntent) -> Self {
        Self {
            client_order_id: intent.intent_id,
            symbol:          &intent.symbol,
            side:            intent.side,
            size:            intent.size,
            order_type:      intent.order_type,
            leverage:        intent.leverage,
            reduce_only:     intent.reduce_only,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeAck {
    ok:       bool,
    order_id: Option<String>,
    reason:   Option<String>,
}

// ─── Client ───────────────────────────────────────────────────────────────────

pub struct HttpExchange {
    client:   reqwest::Client,
    base_url: String,
    api_key:  Option<String>,
}

impl HttpExchange {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None      => builder,
        }
    }

    async fn send(
        &self,
        call: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TradeError> {
        let response = builder.send().await.map_err(|e| {
            error!(call, error = %e, "Exchange bridge unreachable");
            TradeError::ExchangeTransient { call, reason: format!("unreachable: {e}") }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(call, http_status = %status, body = %body, "Exchange bridge returned HTTP error");
        Err(classify_status(call, status, body))
    }
}

/// 4xx = ปฏิเสธ (ยกเว้น 408 timeout / 429 rate limit), 5xx = transient
fn classify_status(call: &'static str, status: StatusCode, body: String) -> TradeError {
    let reason = format!("HTTP {status}: {body}");
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        TradeError::ExchangeTransient { call, reason }
    } else {
        TradeError::ExchangeRejected { call, reason }
    }
}

fn parse_err(call: &'static str, err: reqwest::Error) -> TradeError {
    TradeError::ExchangeTransient { call, reason: format!("response parse error: {err}") }
}

#[async_trait]
impl Exchange for HttpExchange {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get_position(&self, symbol: &str) -> Result<ExchangePosition, TradeError> {
        const CALL: &str = "get_position";
        let builder = self
            .request(reqwest::Method::GET, "/position")
            .query(&[("symbol", symbol)]);
        self.send(CALL, builder)
            .await?
            .json()
            .await
            .map_err(|e| parse_err(CALL, e))
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<String, TradeError> {
        const CALL: &str = "submit_order";
        let body = BridgeOrderRequest::from(intent);

        info!(
            symbol      = %intent.symbol,
            side        = ?intent.side,
            size        = intent.size,
            reduce_only = intent.reduce_only,
            intent_id   = %intent.intent_id,
            "🚀 [EXCHANGE] Sending order"
        );

        let ack: BridgeAck = self
            .send(CALL, self.request(reqwest::Method::POST, "/order").json(&body))
            .await?
            .json()
            .await
            .map_err(|e| parse_err(CALL, e))?;

        match (ack.ok, ack.order_id) {
            (true, Some(order_id)) => {
                info!(order_id = %order_id, "✅ [EXCHANGE] Order accepted");
                Ok(order_id)
            }
            (_, _) => Err(TradeError::ExchangeRejected {
                call:   CALL,
                reason: ack.reason.unwrap_or_else(|| "rejected without reason".to_string()),
            }),
        }
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, TradeError> {
        const CALL: &str = "get_order_status";
        let path = format!("/order/{order_id}");
        self.send(CALL, self.request(reqwest::Method::GET, &path))
            .await?
            .json()
            .await
            .map_err(|e| parse_err(CALL, e))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), TradeError> {
        const CALL: &str = "cancel_order";
        let path = format!("/order/{order_id}");
        let ack: BridgeAck = self
            .send(CALL, self.request(reqwest::Method::DELETE, &path))
            .await?
            .json()
            .await
            .map_err(|e| parse_err(CALL, e))?;

        if ack.ok {
            Ok(())
        } else {
            Err(TradeError::ExchangeRejected {
                call:   CALL,
                reason: ack.reason.unwrap_or_else(|| "cancel refused".to_string()),
            })
        }
    }
}
