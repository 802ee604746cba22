pub mod control;
pub mod monitor;

use axum::{
    routing::{get, post},
    Router,
};

use crate::auth::require_api_key;
use crate::config::base_asset;
use crate::error::AppError;
use crate::state::SharedState;

/// Router ของ monitor / control API (ยังไม่รวม Trace / CORS layer)
pub fn router(state: SharedState) -> Router {
    Router::new()
        // ── Monitor Loop ─────────────────────────────────────────────────────
        .route("/ws/monitor",                 get(monitor::ws_monitor))
        .route("/api/health",                 get(monitor::health))
        .route("/api/positions",              get(monitor::list_positions))
        .route("/api/positions/:symbol",      get(monitor::get_position))
        .route("/api/memory/:symbol",         get(monitor::get_memory))
        .route("/api/insights/:symbol",       get(monitor::get_insight))
        .route("/api/stats",                  get(monitor::get_stats))
        // ── Operator Controls ────────────────────────────────────────────────
        .route("/api/risk/kill",              post(control::kill_switch_on))
        .route("/api/risk/rearm",             post(control::kill_switch_off))
        .route("/api/risk/status",            get(control::get_risk_status))
        .route("/api/control/drain",          post(control::drain))
        .route("/api/positions/:symbol/ack",  post(control::acknowledge_position))
        // ── Auth ─────────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// `BTC` / `btc-usdt` / `BTC/USDT` → symbol ที่ตั้งค่าไว้
pub(crate) fn resolve_symbol(state: &SharedState, raw: &str) -> Result<String, AppError> {
    let wanted = raw.trim().to_ascii_uppercase().replace('-', "/");
    state
        .coordinator
        .config()
        .symbols
        .iter()
        .find(|s| s.to_ascii_uppercase() == wanted || base_asset(s).eq_ignore_ascii_case(&wanted))
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("symbol '{raw}' is not traded")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::testing::ScriptedModel;
    use crate::coordinator::testing::{Harness, BTC, OPEN_LONG};
    use crate::models::PositionSide;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app(h: &Harness, api_key: Option<&str>) -> (Router, SharedState) {
        let state = AppState::new(
            Arc::clone(&h.coordinator),
            Arc::clone(&h.reconciler),
            Arc::clone(&h.risk),
            h.events.clone(),
            api_key.map(str::to_string),
        );
        (router(state.clone()), state)
    }

    async fn send(app: Router, method: &str, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            request = request.header("X-API-Key", key);
        }
        let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_position_and_memory_endpoints() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        h.cycle().await;
        h.price(48_750.0).await;
        h.cycle().await;
        let (app, _) = app(&h, None).await;

        let (status, body) = send(app.clone(), "GET", "/api/positions/btc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position"]["side"], "flat");

        let (status, body) = send(app.clone(), "GET", "/api/memory/BTC-USDT?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["reason"], "stop-loss");
        assert_eq!(body["records"][0]["outcome"], "failure");

        let (status, body) = send(app.clone(), "GET", "/api/insights/BTC?strategy=balanced", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["insight"]["count"], 1);

        let (status, _) = send(app.clone(), "GET", "/api/memory/BTC?strategy=yolo", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app, "GET", "/api/positions/DOGE", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_api_key_guard() {
        let h = Harness::new(ScriptedModel::new(Vec::new())).await;
        let (app, _) = app(&h, Some("s3cret")).await;

        let (status, body) = send(app.clone(), "GET", "/api/stats", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);

        let (status, _) = send(app.clone(), "GET", "/api/stats", Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn test_kill_blocks_opens_until_rearm() {
        let h = Harness::new(ScriptedModel::always(OPEN_LONG)).await;
        let (app, state) = app(&h, None).await;

        let (status, _) = send(app.clone(), "POST", "/api/risk/kill", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.risk.is_killed().await);
        assert_eq!(h.cycle().await, crate::coordinator::SymbolOutcome::Held("open not approved".to_string()));

        let (_, body) = send(app.clone(), "POST", "/api/risk/rearm", None).await;
        assert_eq!(body["ok"], true);
        let (_, body) = send(app, "GET", "/api/risk/status", None).await;
        assert_eq!(body["risk"]["is_killed"], false);
    }

    #[tokio::test]
    async fn test_drain_and_acknowledge() {
        let h = Harness::new(ScriptedModel::new(Vec::new())).await;
        h.exchange.set_position(BTC, PositionSide::Long, 0.05, 49_000.0).await;
        h.coordinator.recover().await;
        let (app, state) = app(&h, None).await;

        let (status, body) = send(app.clone(), "POST", "/api/positions/BTC/ack", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position"]["needs_attention"], false);
        assert!(!state.reconciler.get_local(BTC).await.needs_attention);

        let (status, _) = send(app.clone(), "POST", "/api/control/drain", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(state.coordinator.is_draining());

        let (_, body) = send(app, "GET", "/api/health", None).await;
        assert_eq!(body["status"], "draining");
    }
}
