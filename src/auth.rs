//! # auth — API Key Middleware
//!
//! ป้องกัน monitor / control API ด้วย `X-API-Key` header
//!
//! ## Mode
//! - `API_KEY` ไม่ได้ตั้ง (หรือ empty) → **Allow All** (Dev Mode)
//! - `API_KEY` ตั้งค่า → ต้องส่ง `X-API-Key: <key>` ทุก Request
//!
//! `/api/health` ไม่ต้อง Auth
//!
//! ```bash
//! curl -X POST -H "X-API-Key: $API_KEY" http://localhost:3000/api/control/drain
//! ```

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::state::SharedState;

const EXEMPT_PATHS: [&str; 1] = ["/api/health"];

pub async fn require_api_key(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if EXEMPT_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected {
        next.run(request).await
    } else {
        warn!(path, "❌ Unauthorized request, invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
                "hint":  "Set X-API-Key header with your API key"
            })),
        )
            .into_response()
    }
}
