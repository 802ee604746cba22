//! # routes::monitor
//!
//! **Monitor Loop**: อ่านอย่างเดียว: Position table, Memory, Insight, สถิติ
//!
//! | Method    | Path                       | Description                          |
//! |-----------|----------------------------|--------------------------------------|
//! | GET (WS)  | `/ws/monitor`              | WebSocket real-time event stream     |
//! | GET       | `/api/health`              | Liveness (ไม่ต้อง API key)            |
//! | GET       | `/api/positions`           | Position ทุก symbol                  |
//! | GET       | `/api/positions/:symbol`   | Position ของ symbol เดียว            |
//! | GET       | `/api/memory/:symbol`      | Memory Records ใหม่สุดก่อน            |
//! | GET       | `/api/insights/:symbol`    | Insight ที่ Advisory เห็น              |
//! | GET       | `/api/stats`               | cycles, orders, win rate, stages     |
//!
//! symbol ใน path ใช้ `BTC`, `BTC-USDT` หรือ `BTC%2FUSDT` ได้

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::resolve_symbol;
use crate::error::AppError;
use crate::models::{MemoryQuery, MemoryRecord, StrategyLabel};
use crate::state::SharedState;

const DEFAULT_MEMORY_LIMIT: usize = 50;
const MAX_MEMORY_LIMIT: usize = 500;

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Upgrade HTTP → WebSocket แล้ว subscribe EventBus
///
/// ทุก `WsEvent` ถูกส่งเป็น JSON text frame
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── Snapshot ปัจจุบันทันทีที่ต่อ ─────────────────────────────────────────
    let snapshot = json!({
        "event":     "SNAPSHOT",
        "positions": state.reconciler.all().await,
        "stats":     state.coordinator.stats().await,
        "risk":      state.risk.status().await,
    })
    .to_string();

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST ─────────────────────────────────────────────────────────────────────

/// GET /api/health
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let uptime = Utc::now().signed_duration_since(state.started_at).num_seconds();
    Json(json!({
        "ok":          true,
        "status":      if state.coordinator.is_draining() { "draining" } else { "running" },
        "uptime_secs": uptime,
        "memory":      state.memory.backend(),
        "symbols":     state.coordinator.config().symbols,
    }))
}

/// GET /api/positions
pub async fn list_positions(State(state): State<SharedState>) -> impl IntoResponse {
    let positions = state.reconciler.all().await;
    Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    }))
}

/// GET /api/positions/:symbol
pub async fn get_position(
    State(state): State<SharedState>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let symbol = resolve_symbol(&state, &symbol)?;
    let position = state.reconciler.get_local(&symbol).await;
    Ok(Json(json!({ "ok": true, "position": position })))
}

#[derive(Debug, Deserialize)]
pub struct MemoryParams {
    pub strategy: Option<String>,
    pub limit:    Option<usize>,
}

fn parse_strategy(raw: Option<&str>) -> Result<Option<StrategyLabel>, AppError> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<StrategyLabel>().map_err(AppError::BadRequest))
        .transpose()
}

/// GET /api/memory/:symbol?strategy=&limit=
pub async fn get_memory(
    State(state): State<SharedState>,
    Path(symbol): Path<String>,
    Query(params): Query<MemoryParams>,
) -> Result<impl IntoResponse, AppError> {
    let symbol = resolve_symbol(&state, &symbol)?;
    let strategy = parse_strategy(params.strategy.as_deref())?;
    let limit = params.limit.unwrap_or(DEFAULT_MEMORY_LIMIT).clamp(1, MAX_MEMORY_LIMIT);

    let records: Vec<MemoryRecord> = state
        .memory
        .query(MemoryQuery::symbol(&symbol).strategy(strategy).limit(limit))
        .await?
        .collect();

    Ok(Json(json!({
        "ok":      true,
        "symbol":  symbol,
        "count":   records.len(),
        "records": records,
    })))
}

/// GET /api/insights/:symbol?strategy=
pub async fn get_insight(
    State(state): State<SharedState>,
    Path(symbol): Path<String>,
    Query(params): Query<MemoryParams>,
) -> Result<impl IntoResponse, AppError> {
    let symbol = resolve_symbol(&state, &symbol)?;
    let strategy = parse_strategy(params.strategy.as_deref())?;
    let insight = state.memory.summarize(&symbol, strategy).await?;
    Ok(Json(json!({ "ok": true, "insight": insight })))
}

/// GET /api/stats
pub async fn get_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":    true,
        "stats": state.coordinator.stats().await,
    }))
}
