use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Every registered client with its languages and upstream state.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry.snapshot();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_concurrent_sessions": state.registry.max_sessions(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let client_id = path.into_inner();
    let session = state
        .registry
        .get(&client_id)
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", client_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "client_id": session.client_id(),
        "from": session.languages().from,
        "to": session.languages().to,
        "state": session.state()
    })))
}
