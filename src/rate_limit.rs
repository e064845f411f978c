use crate::config::RateLimitSettings;
use crate::errors::AppError;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Auth,
    Documents,
    Mutation,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Documents => "documents",
            Self::Mutation => "mutation",
        }
    }

    /// Which limit, if any, guards this request.
    pub fn classify(method: &Method, path: &str) -> Option<Self> {
        if *method == Method::POST && path == "/api/auth/login" {
            return Some(Self::Auth);
        }
        if !matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE) {
            return None;
        }
        if under(path, "/api/documents") {
            return Some(Self::Documents);
        }
        ["/api/events", "/api/reminders", "/api/workplan"]
            .iter()
            .any(|prefix| under(path, prefix))
            .then_some(Self::Mutation)
    }
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    hits: u32,
}

/// Fixed-window counters keyed by client and scope.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<(String, Scope), Window>>>,
    settings: RateLimitSettings,
    trust_forwarded_for: bool,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, trust_forwarded_for: bool) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            settings,
            trust_forwarded_for,
        }
    }

    fn max_for(&self, scope: Scope) -> u32 {
        match scope {
            Scope::Auth => self.settings.auth_max,
            Scope::Documents => self.settings.document_max,
            Scope::Mutation => self.settings.mutation_max,
        }
    }

    /// `Err` carries the seconds until the window resets.
    pub async fn check(&self, client: &str, scope: Scope) -> Result<(), u64> {
        let now = Instant::now();
        let window_length = self.settings.window;
        let mut windows = self.windows.lock().await;
        windows.retain(|_, window| now.duration_since(window.started) < window_length);

        let window = windows
            .entry((client.to_string(), scope))
            .or_insert(Window { started: now, hits: 0 });
        if window.hits >= self.max_for(scope) {
            let remaining = window_length.saturating_sub(now.duration_since(window.started));
            return Err(remaining.as_secs().max(1));
        }
        window.hits += 1;
        Ok(())
    }

    /// Behind one trusted proxy the client is the entry that proxy appended,
    /// so only the rightmost `X-Forwarded-For` value is used.
    fn client_key(&self, request: &Request) -> String {
        if self.trust_forwarded_for {
            let forwarded = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.rsplit(',').map(str::trim).find(|entry| !entry.is_empty()));
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

pub async fn enforce_rate_limit(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    let Some(scope) = Scope::classify(request.method(), request.uri().path()) else {
        return next.run(request).await;
    };
    let client = limiter.client_key(&request);
    match limiter.check(&client, scope).await {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            tracing::warn!(client = %client, scope = scope.as_str(), "rate limit exceeded");
            AppError::RateLimited { retry_after_secs }.into_response()
        }
    }
}
