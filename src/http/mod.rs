pub mod handlers;
pub mod intake;
pub mod resources;

use crate::auth::csrf::{require_csrf_token, CsrfProtection, CSRF_HEADER};
use crate::auth::{token_from_headers, AuthService};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, InternalErrorDetail};
use crate::models::{Document, Event, Reminder, WorkplanItem};
use crate::rate_limit::{enforce_rate_limit, RateLimiter};
use crate::store::JsonStore;
use crate::uploads::cleanup::{CleanupQueue, CleanupRetry};
use crate::uploads::UploadManager;
use axum::extract::{DefaultBodyLimit, FromRef, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use resources::Resource;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::Instrument;

/// Largest accepted body: the biggest upload plus room for text fields.
const BODY_LIMIT_BYTES: usize = 11 * 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: JsonStore,
    pub uploads: UploadManager,
    pub auth: AuthService,
    pub csrf: CsrfProtection,
    pub started_at: Instant,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

impl AppState {
    /// Opens the store, starts the cleanup worker and seeds the admin user.
    pub async fn initialize(config: AppConfig) -> AppResult<Self> {
        let store = JsonStore::open(config.data_file())?;
        let cleanup = CleanupQueue::start(CleanupRetry::default());
        let uploads = UploadManager::new(&config.uploads_dir, cleanup)?;
        let auth = AuthService::new(&config);
        auth.ensure_admin(&store, &config.admin_username, &config.admin_password)
            .await?;

        Ok(Self {
            csrf: CsrfProtection::new(&config),
            config: Arc::new(config),
            store,
            uploads,
            auth,
            started_at: Instant::now(),
        })
    }
}

fn resource_routes<R: Resource>(path: &str) -> Router<AppState> {
    Router::new()
        .route(path, get(resources::list::<R>).post(resources::create::<R>))
        .route(
            &format!("{path}/:id"),
            get(resources::get_one::<R>)
                .put(resources::update::<R>)
                .delete(resources::remove::<R>),
        )
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/login", post(handlers::login))
        .route("/auth/verify", get(handlers::verify))
        .route("/auth/csrf-token", get(handlers::csrf_token))
        .route("/auth/logout", post(handlers::logout))
        .merge(resource_routes::<Event>("/events"))
        .merge(resource_routes::<Document>("/documents"))
        .merge(resource_routes::<Reminder>("/reminders"))
        .merge(resource_routes::<WorkplanItem>("/workplan"));

    let mut uploads = Router::new().nest_service("/uploads", ServeDir::new(state.uploads.root()));
    if state.config.uploads_require_auth {
        uploads = uploads.layer(from_fn_with_state(state.clone(), require_upload_auth));
    }

    let limiter = RateLimiter::new(
        state.config.rate_limits.clone(),
        state.config.environment.is_production(),
    );

    Router::new()
        .nest("/api", api)
        .merge(uploads)
        .fallback(handlers::endpoint_not_found)
        .layer(from_fn_with_state(limiter, enforce_rate_limit))
        .layer(from_fn(require_csrf_token))
        .layer(from_fn_with_state(state.clone(), mask_internal_errors))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(cors_layer(&state.config))
        .layer(from_fn(trace_requests))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, HeaderName::from_static(CSRF_HEADER)])
}

async fn trace_requests(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(ToString::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "http.request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id,
    );
    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    span.in_scope(|| {
        if status >= 500 {
            tracing::error!(status, latency_ms, "request failed");
        } else {
            tracing::info!(status, latency_ms, "request completed");
        }
    });

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// In production, 500 bodies never carry internal detail.
async fn mask_internal_errors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if state.config.environment.is_production() && response.extensions().get::<InternalErrorDetail>().is_some() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Internal Server Error"})),
        )
            .into_response();
    }
    response
}

async fn require_upload_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(token) = token_from_headers(request.headers()) else {
        return AppError::Unauthorized("Access token required".to_string()).into_response();
    };
    match state.auth.decode(&token) {
        Ok(_) => next.run(request).await,
        Err(error) => error.into_response(),
    }
}
