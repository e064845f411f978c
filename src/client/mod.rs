pub mod forms;

use crate::errors::CSRF_ERROR_CODE;
use crate::models::{
    CsrfTokenResponse, Document, Event, HealthResponse, LoginResponse, PageResponse, Reminder, SuccessResponse,
    VerifyResponse, WorkplanItem,
};
use forms::{ContentForm, DocumentForm, EventForm, FormPayload, ReminderForm, WorkplanForm};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

pub const CSRF_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;

const MSG_UNAUTHORIZED: &str = "Authentication required";
const MSG_FORBIDDEN: &str = "Insufficient permissions";
const MSG_NOT_FOUND: &str = "Resource not found";
const MSG_SERVER_ERROR: &str = "Server error. Please try again later";
const MSG_STALE_SESSION: &str = "Session is stale. Refresh and retry the action";
const MSG_TIMEOUT: &str = "Request timed out. Check your connection and try again";
const MSG_CANCELLED: &str = "Request was cancelled";
const MSG_NETWORK: &str = "Network error. Check your connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Http,
    Network,
    Timeout,
    Cancelled,
    Validation,
    Decode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Field-level messages from a validation failure.
    pub details: Vec<String>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Only network-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        self.kind == ApiErrorKind::Network
    }

    fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::new(ApiErrorKind::Timeout, None, MSG_TIMEOUT)
        } else {
            tracing::debug!(error = %error, "request failed at transport level");
            Self::new(ApiErrorKind::Network, None, MSG_NETWORK)
        }
    }
}

/// Maps a non-2xx response to an error; the flag reports a CSRF rejection.
pub fn error_for_status(status: u16, body: &[u8]) -> (ApiError, bool) {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|value| value.get(name))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    };

    let csrf_rejected = status == 403
        && (field("code").as_deref() == Some(CSRF_ERROR_CODE)
            || field("error").is_some_and(|error| error.to_lowercase().contains("csrf token")));

    let message = if csrf_rejected {
        MSG_STALE_SESSION.to_string()
    } else {
        match status {
            401 => MSG_UNAUTHORIZED.to_string(),
            403 => MSG_FORBIDDEN.to_string(),
            404 => MSG_NOT_FOUND.to_string(),
            500 | 502 | 503 => MSG_SERVER_ERROR.to_string(),
            _ => field("message")
                .or_else(|| field("error"))
                .unwrap_or_else(|| format!("Error: {status}")),
        }
    };

    let mut error = ApiError::new(ApiErrorKind::Http, Some(status), message);
    if let Some(Value::Array(details)) = parsed.as_ref().and_then(|value| value.get("details")) {
        error.details = details.iter().filter_map(Value::as_str).map(ToString::to_string).collect();
    }
    (error, csrf_rejected)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// 1x, 2x, 4x the base delay for the first, second and third retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Cancels in-flight requests that were given this signal.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

async fn wait_for_abort(signal: Option<&AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

#[derive(Clone)]
pub struct FetchOptions {
    pub retries: u32,
    pub timeout: Duration,
    pub signal: Option<AbortSignal>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            signal: None,
        }
    }
}

impl FetchOptions {
    pub fn with_signal(signal: Option<AbortSignal>) -> Self {
        Self {
            signal,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
enum RequestBody {
    Empty,
    Json(Value),
    Form(FormPayload),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: RequestBody,
    csrf_token: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            csrf_token: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, payload: FormPayload) -> Self {
        self.body = RequestBody::Form(payload);
        self
    }

    /// Attached only to POST/PUT/DELETE, and only when non-empty.
    pub fn with_csrf(mut self, token: String) -> Self {
        let mutating = matches!(self.method, Method::POST | Method::PUT | Method::DELETE);
        if mutating && !token.is_empty() {
            self.csrf_token = Some(token);
        }
        self
    }

    fn retryable(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CsrfCache {
    value: Option<String>,
    fetched_at: Option<Instant>,
}

impl CsrfCache {
    pub fn fresh(&self, now: Instant) -> Option<&str> {
        match (&self.value, self.fetched_at) {
            (Some(value), Some(fetched_at)) if now.duration_since(fetched_at) < CSRF_TOKEN_TTL => Some(value),
            _ => None,
        }
    }

    pub fn store(&mut self, value: String, now: Instant) {
        self.value = Some(value);
        self.fetched_at = Some(now);
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.fetched_at = None;
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

/// Typed client for the HTTP API: per-attempt timeouts, retries for reads,
/// and a cached CSRF token for mutations.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    csrf: Mutex<CsrfCache>,
    retry: RetryPolicy,
}

impl ApiClient {
    /// `base_url` points at the API root, e.g. `http://localhost:5000/api`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_retry_policy(base_url, RetryPolicy::default())
    }

    pub fn with_retry_policy(base_url: impl Into<String>, retry: RetryPolicy) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| ApiError::new(ApiErrorKind::Network, None, err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            csrf: Mutex::new(CsrfCache::default()),
            retry,
        })
    }

    pub async fn csrf_cache(&self) -> CsrfCache {
        self.csrf.lock().await.clone()
    }

    pub async fn api_fetch<T: DeserializeOwned>(&self, request: ApiRequest, options: FetchOptions) -> Result<T, ApiError> {
        let signal = options.signal.as_ref();
        let mut retry = 0u32;
        loop {
            if signal.is_some_and(AbortSignal::is_aborted) {
                return Err(ApiError::new(ApiErrorKind::Cancelled, None, MSG_CANCELLED));
            }

            let attempt = tokio::time::timeout(options.timeout, self.send_once(&request));
            let outcome = tokio::select! {
                result = attempt => match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ApiError::new(ApiErrorKind::Timeout, None, MSG_TIMEOUT)),
                },
                _ = wait_for_abort(signal) => Err(ApiError::new(ApiErrorKind::Cancelled, None, MSG_CANCELLED)),
            };

            match outcome {
                Ok((status, body)) => return self.handle_response(status, &body).await,
                Err(error) if error.is_transient() && request.retryable() && retry < options.retries => {
                    let delay = self.retry.delay_for(retry);
                    retry += 1;
                    tracing::warn!(
                        method = %request.method,
                        path = %request.path,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "network error, retrying request"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_abort(signal) => {
                            return Err(ApiError::new(ApiErrorKind::Cancelled, None, MSG_CANCELLED));
                        }
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<(StatusCode, Vec<u8>), ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(token) = &request.csrf_token {
            builder = builder.header("X-CSRF-Token", token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(payload) => builder.multipart(payload.to_multipart()?),
        };

        let response = builder.send().await.map_err(ApiError::from_transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::from_transport)?;
        Ok((status, body.to_vec()))
    }

    async fn handle_response<T: DeserializeOwned>(&self, status: StatusCode, body: &[u8]) -> Result<T, ApiError> {
        if status.is_success() {
            return serde_json::from_slice(body).map_err(|err| {
                ApiError::new(ApiErrorKind::Decode, Some(status.as_u16()), format!("Unexpected response: {err}"))
            });
        }

        let (error, csrf_rejected) = error_for_status(status.as_u16(), body);
        if csrf_rejected {
            tracing::info!("csrf token rejected, clearing cached token");
            self.csrf.lock().await.clear();
        }
        Err(error)
    }

    /// Cached token, refreshed after the TTL; an empty string when the
    /// token endpoint is unreachable.
    async fn csrf_token(&self) -> String {
        if let Some(token) = self.csrf.lock().await.fresh(Instant::now()) {
            return token.to_string();
        }
        match self
            .api_fetch::<CsrfTokenResponse>(ApiRequest::get("/auth/csrf-token"), FetchOptions::default())
            .await
        {
            Ok(response) => {
                self.csrf
                    .lock()
                    .await
                    .store(response.csrf_token.clone(), Instant::now());
                response.csrf_token
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to fetch csrf token");
                String::new()
            }
        }
    }

    async fn mutate<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let token = self.csrf_token().await;
        self.api_fetch(request.with_csrf(token), FetchOptions::default()).await
    }

    async fn read<T: DeserializeOwned>(&self, path: String, signal: Option<AbortSignal>) -> Result<T, ApiError> {
        self.api_fetch(ApiRequest::get(path), FetchOptions::with_signal(signal)).await
    }

    async fn submit<T: DeserializeOwned, F: ContentForm>(&self, method: Method, path: String, form: &F) -> Result<T, ApiError> {
        let payload = form.payload()?;
        self.mutate(ApiRequest::new(method, path).form(payload)).await
    }

    pub async fn list_events(&self, signal: Option<AbortSignal>) -> Result<Vec<Event>, ApiError> {
        self.read("/events".to_string(), signal).await
    }

    pub async fn list_events_page(&self, page: usize, limit: usize) -> Result<PageResponse<Event>, ApiError> {
        self.read(format!("/events?page={page}&limit={limit}"), None).await
    }

    pub async fn get_event(&self, id: u64, signal: Option<AbortSignal>) -> Result<Event, ApiError> {
        self.read(format!("/events/{id}"), signal).await
    }

    pub async fn create_event(&self, form: &EventForm) -> Result<Event, ApiError> {
        self.submit(Method::POST, "/events".to_string(), form).await
    }

    pub async fn update_event(&self, id: u64, form: &EventForm) -> Result<Event, ApiError> {
        self.submit(Method::PUT, format!("/events/{id}"), form).await
    }

    pub async fn delete_event(&self, id: u64) -> Result<SuccessResponse, ApiError> {
        self.mutate(ApiRequest::new(Method::DELETE, format!("/events/{id}"))).await
    }

    pub async fn list_documents(&self, signal: Option<AbortSignal>) -> Result<Vec<Document>, ApiError> {
        self.read("/documents".to_string(), signal).await
    }

    pub async fn get_document(&self, id: u64, signal: Option<AbortSignal>) -> Result<Document, ApiError> {
        self.read(format!("/documents/{id}"), signal).await
    }

    pub async fn create_document(&self, form: &DocumentForm) -> Result<Document, ApiError> {
        self.submit(Method::POST, "/documents".to_string(), form).await
    }

    pub async fn update_document(&self, id: u64, form: &DocumentForm) -> Result<Document, ApiError> {
        self.submit(Method::PUT, format!("/documents/{id}"), form).await
    }

    pub async fn delete_document(&self, id: u64) -> Result<SuccessResponse, ApiError> {
        self.mutate(ApiRequest::new(Method::DELETE, format!("/documents/{id}"))).await
    }

    pub async fn list_reminders(&self, signal: Option<AbortSignal>) -> Result<Vec<Reminder>, ApiError> {
        self.read("/reminders".to_string(), signal).await
    }

    pub async fn get_reminder(&self, id: u64, signal: Option<AbortSignal>) -> Result<Reminder, ApiError> {
        self.read(format!("/reminders/{id}"), signal).await
    }

    pub async fn create_reminder(&self, form: &ReminderForm) -> Result<Reminder, ApiError> {
        self.submit(Method::POST, "/reminders".to_string(), form).await
    }

    pub async fn update_reminder(&self, id: u64, form: &ReminderForm) -> Result<Reminder, ApiError> {
        self.submit(Method::PUT, format!("/reminders/{id}"), form).await
    }

    pub async fn delete_reminder(&self, id: u64) -> Result<SuccessResponse, ApiError> {
        self.mutate(ApiRequest::new(Method::DELETE, format!("/reminders/{id}"))).await
    }

    pub async fn list_workplan(&self, signal: Option<AbortSignal>) -> Result<Vec<WorkplanItem>, ApiError> {
        self.read("/workplan".to_string(), signal).await
    }

    pub async fn get_workplan_item(&self, id: u64, signal: Option<AbortSignal>) -> Result<WorkplanItem, ApiError> {
        self.read(format!("/workplan/{id}"), signal).await
    }

    pub async fn create_workplan_item(&self, form: &WorkplanForm) -> Result<WorkplanItem, ApiError> {
        self.submit(Method::POST, "/workplan".to_string(), form).await
    }

    pub async fn update_workplan_item(&self, id: u64, form: &WorkplanForm) -> Result<WorkplanItem, ApiError> {
        self.submit(Method::PUT, format!("/workplan/{id}"), form).await
    }

    pub async fn delete_workplan_item(&self, id: u64) -> Result<SuccessResponse, ApiError> {
        self.mutate(ApiRequest::new(Method::DELETE, format!("/workplan/{id}"))).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let request = ApiRequest::new(Method::POST, "/auth/login")
            .json(json!({"username": username, "password": password}));
        self.mutate(request).await
    }

    /// Never fails: any error reads as an invalid session.
    pub async fn verify_token(&self, signal: Option<AbortSignal>) -> VerifyResponse {
        match self.read::<VerifyResponse>("/auth/verify".to_string(), signal).await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(error = %error, "token verification failed");
                VerifyResponse { valid: false, user: None }
            }
        }
    }

    /// The CSRF cache is cleared whatever the outcome.
    pub async fn logout(&self) -> Result<SuccessResponse, ApiError> {
        let result = self.mutate(ApiRequest::new(Method::POST, "/auth/logout")).await;
        self.csrf.lock().await.clear();
        result
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        self.read("/health".to_string(), None).await
    }
}
