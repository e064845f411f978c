use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use axum::extract::Request;
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

pub const CSRF_COOKIE: &str = "_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";
const ACCEPTED_HEADERS: &[&str] = &[CSRF_HEADER, "csrf-token", "x-xsrf-token"];

type HmacSha256 = Hmac<Sha256>;

/// Double-submit CSRF protection: a random secret in an httpOnly cookie,
/// and tokens that are `<salt>.<base64url(HMAC-SHA256(secret, salt))>`.
#[derive(Debug, Clone)]
pub struct CsrfProtection {
    same_site: axum_extra::extract::cookie::SameSite,
    secure: bool,
}

impl CsrfProtection {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            same_site: super::same_site(config.csrf_same_site()),
            secure: config.secure_cookies(),
        }
    }

    pub fn generate_secret() -> String {
        random_token::<18>()
    }

    pub fn issue_token(secret: &str) -> AppResult<String> {
        let salt = random_token::<8>();
        let signature = sign(secret, &salt)?;
        Ok(format!("{salt}.{signature}"))
    }

    pub fn verify_token(secret: &str, token: &str) -> bool {
        let Some((salt, signature)) = token.split_once('.') else {
            return false;
        };
        let Ok(expected) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(salt.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Returns the jar (with a fresh secret cookie when none was present)
    /// and a token bound to the secret.
    pub fn token_for(&self, jar: CookieJar) -> AppResult<(CookieJar, String)> {
        let existing = jar.get(CSRF_COOKIE).map(|cookie| cookie.value().to_string());
        let (jar, secret) = match existing {
            Some(secret) if !secret.is_empty() => (jar, secret),
            _ => {
                let secret = Self::generate_secret();
                (jar.add(self.secret_cookie(secret.clone())), secret)
            }
        };
        let token = Self::issue_token(&secret)?;
        Ok((jar, token))
    }

    fn secret_cookie(&self, secret: String) -> Cookie<'static> {
        Cookie::build((CSRF_COOKIE, secret))
            .http_only(true)
            .same_site(self.same_site)
            .secure(self.secure)
            .path("/")
            .build()
    }
}

fn sign(secret: &str, salt: &str) -> AppResult<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|err| AppError::Internal(err.to_string()))?;
    mac.update(salt.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn random_token<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn submitted_token(headers: &HeaderMap) -> Option<&str> {
    ACCEPTED_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
}

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Global middleware: unsafe methods need a token matching the secret cookie.
pub async fn require_csrf_token(request: Request, next: Next) -> Response {
    if is_safe(request.method()) {
        return next.run(request).await;
    }

    let jar = CookieJar::from_headers(request.headers());
    let valid = match (jar.get(CSRF_COOKIE), submitted_token(request.headers())) {
        (Some(secret), Some(token)) => CsrfProtection::verify_token(secret.value(), token),
        _ => false,
    };

    if !valid {
        tracing::warn!(method = %request.method(), path = %request.uri().path(), "csrf token rejected");
        return AppError::CsrfRejected.into_response();
    }
    next.run(request).await
}
