use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let settings = state.assembler.settings();
    let body = json!({
        "status": "ok",
        "generation": state.assembler.can_generate(),
        "max_attempts": settings.max_attempts,
    });
    (StatusCode::OK, Json(body))
}
