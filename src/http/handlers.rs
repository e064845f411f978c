use super::AppState;
use crate::auth::token_from_headers;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CsrfTokenResponse, HealthResponse, LoginRequest, LoginResponse, SuccessResponse, VerifyResponse,
};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde_json::json;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = if state.store.probe().await { "connected" } else { "error" };
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        database: database.to_string(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        environment: state.config.environment.as_str().to_string(),
        uploads_cleanup: state.uploads.cleanup().stats(),
    })
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> AppResult<(CookieJar, Json<LoginResponse>)> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        LoginRequest {
            username: None,
            password: None,
        }
    } else {
        serde_json::from_slice(&body).map_err(|err| AppError::BadRequest(format!("Invalid JSON body: {err}")))?
    };

    let (user, token) = state.auth.login(&state.store, request).await?;
    let jar = jar.add(state.auth.session_cookie(token));
    Ok((jar, Json(LoginResponse { user })))
}

pub async fn verify(State(state): State<AppState>, headers: HeaderMap) -> Json<VerifyResponse> {
    Json(state.auth.verify(&state.store, token_from_headers(&headers)).await)
}

pub async fn csrf_token(State(state): State<AppState>, jar: CookieJar) -> AppResult<(CookieJar, Json<CsrfTokenResponse>)> {
    let (jar, csrf_token) = state.csrf.token_for(jar)?;
    Ok((jar, Json(CsrfTokenResponse { csrf_token })))
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Json<SuccessResponse>) {
    let jar = jar.remove(state.auth.cleared_session_cookie());
    (jar, Json(SuccessResponse { success: true }))
}

pub async fn endpoint_not_found(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Endpoint not found", "path": uri.path()})),
    )
        .into_response()
}
