//! # error
//!
//! Error types ของทั้งระบบ
//!
//! - [`TradeError`]: taxonomy ของ trading loop (snapshot / advisory / exchange /
//!   reconciliation / memory store) ใช้ภายใน Coordinator ทุก Stage
//! - [`AppError`]: error ของ HTTP surface (monitor / control API) แปลงเป็น
//!   JSON `{ "ok": false, "error": ... }` ผ่าน `IntoResponse`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::PositionSide;

// ─── Trading Loop Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum TradeError {
    /// Market Snapshot Provider ล่มหรือ timeout: skip symbol รอบนี้
    #[error("snapshot unavailable for {symbol}: {reason}")]
    SnapshotUnavailable { symbol: String, reason: String },

    /// Decision model error / timeout หลัง retry ครบ
    #[error("advisory unavailable for {symbol} after {attempts} attempt(s): {reason}")]
    AdvisoryUnavailable { symbol: String, attempts: u32, reason: String },

    /// คำตอบของ model ไม่ผ่าน validation
    #[error("malformed advice: {0}")]
    MalformedAdvice(String),

    /// Network / rate limit / 5xx: retry ได้
    #[error("exchange transient failure during {call}: {reason}")]
    ExchangeTransient { call: &'static str, reason: String },

    /// Exchange ปฏิเสธ (terminal สำหรับ intent นี้)
    #[error("exchange rejected {call}: {reason}")]
    ExchangeRejected { call: &'static str, reason: String },

    /// ฝั่ง exchange พลิก side โดยที่ระบบไม่ได้ส่ง intent
    #[error("reconciliation conflict on {symbol}: local {local} vs exchange {exchange}")]
    ReconciliationConflict {
        symbol:   String,
        local:    PositionSide,
        exchange: PositionSide,
    },

    /// เขียน Memory Store ไม่ได้
    #[error("memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl TradeError {
    /// Label สั้นๆ สำหรับ structured log field `kind`
    pub fn kind(&self) -> &'static str {
        match self {
            TradeError::SnapshotUnavailable { .. }    => "snapshot_unavailable",
            TradeError::AdvisoryUnavailable { .. }    => "advisory_unavailable",
            TradeError::MalformedAdvice(_)            => "malformed_advice",
            TradeError::ExchangeTransient { .. }      => "exchange_transient",
            TradeError::ExchangeRejected { .. }       => "exchange_rejected",
            TradeError::ReconciliationConflict { .. } => "reconciliation_conflict",
            TradeError::StoreUnavailable(_)           => "store_unavailable",
            TradeError::InvalidInput(_)               => "invalid_input",
        }
    }

    /// Error ที่ควร retry แบบมี backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, TradeError::ExchangeTransient { .. })
    }

    /// Error ที่ต้อง escalate เป็น process-level alert
    pub fn escalates(&self) -> bool {
        matches!(self, TradeError::StoreUnavailable(_))
    }
}

// ─── HTTP Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request was well-formed but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A trading collaborator (memory store, exchange) could not serve the request.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<TradeError> for AppError {
    fn from(err: TradeError) -> Self {
        match err {
            TradeError::InvalidInput(msg) => AppError::BadRequest(msg),
            other                          => AppError::Unavailable(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg)  => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg)    => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(err)    => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let err = TradeError::ExchangeTransient { call: "submit_order", reason: "503".into() };
        assert_eq!(err.kind(), "exchange_transient");
        assert!(err.is_transient());
        assert!(!err.escalates());

        let err = TradeError::StoreUnavailable("disk full".into());
        assert_eq!(err.kind(), "store_unavailable");
        assert!(err.escalates());
    }

    #[test]
    fn test_conflict_message_names_both_sides() {
        let err = TradeError::ReconciliationConflict {
            symbol:   "BTC/USDT".into(),
            local:    PositionSide::Long,
            exchange: PositionSide::Short,
        };
        assert_eq!(
            err.to_string(),
            "reconciliation conflict on BTC/USDT: local long vs exchange short"
        );
    }

    #[test]
    fn test_app_error_status_codes() {
        let resp = AppError::NotFound("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = AppError::from(TradeError::StoreUnavailable("down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = AppError::from(TradeError::InvalidInput("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
