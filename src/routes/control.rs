//! # routes::control
//!
//! Operator controls
//!
//! | Method | Path                          | Description                         |
//! |--------|-------------------------------|-------------------------------------|
//! | POST   | `/api/risk/kill`              | เปิด Kill Switch (หยุดเปิด Position) |
//! | POST   | `/api/risk/rearm`             | ปิด Kill Switch                     |
//! | GET    | `/api/risk/status`            | ดู Risk Status                      |
//! | POST   | `/api/control/drain`          | จบ cycle ที่รันอยู่ ไม่เริ่ม cycle ใหม่ |
//! | POST   | `/api/positions/:symbol/ack`  | รับทราบ Position ที่ synthesize มา  |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::resolve_symbol;
use crate::error::AppError;
use crate::events::WsEvent;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct KillBody {
    pub reason: Option<String>,
}

/// POST /api/risk/kill
pub async fn kill_switch_on(
    State(state): State<SharedState>,
    body: Option<Json<KillBody>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Manual kill via API".to_string());

    state.risk.kill(&reason).await;
    state.events.publish(&WsEvent::RiskKilled { reason: reason.clone() });

    Json(json!({
        "ok":      true,
        "message": format!("Kill switch activated: {reason}"),
    }))
}

/// POST /api/risk/rearm
pub async fn kill_switch_off(State(state): State<SharedState>) -> impl IntoResponse {
    state.risk.rearm().await;

    Json(json!({
        "ok":      true,
        "message": "System re-armed, opens enabled",
    }))
}

/// GET /api/risk/status
pub async fn get_risk_status(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.risk.status().await;
    Json(json!({ "ok": true, "risk": status }))
}

/// POST /api/control/drain: process ยังอยู่จนกว่า loop จะ flush เสร็จ
pub async fn drain(State(state): State<SharedState>) -> impl IntoResponse {
    let already = state.coordinator.is_draining();
    state.coordinator.request_drain();

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "ok":      true,
            "message": if already { "Drain already in progress" } else { "Drain requested" },
        })),
    )
}

/// POST /api/positions/:symbol/ack
pub async fn acknowledge_position(
    State(state): State<SharedState>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let symbol = resolve_symbol(&state, &symbol)?;
    let position = state.reconciler.acknowledge(&symbol).await;
    info!(symbol = %symbol, side = %position.side, "👀 Position acknowledged by operator");
    Ok(Json(json!({ "ok": true, "position": position })))
}
