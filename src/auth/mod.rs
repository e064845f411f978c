pub mod csrf;

use crate::config::{AppConfig, SameSitePolicy};
use crate::errors::{AppError, AppResult};
use crate::models::{LoginRequest, PublicUser, Role, User, VerifyResponse};
use crate::store::JsonStore;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const AUTH_COOKIE: &str = "authToken";
pub const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: u64,
    pub username: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// The identity snapshot taken at login; role changes are not reflected
    /// until the next login.
    pub fn user(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

#[derive(Clone)]
pub struct AuthService {
    keys: Arc<SigningKeys>,
    same_site: SameSite,
    secure: bool,
    bcrypt_rounds: u32,
}

impl AuthService {
    pub fn new(config: &AppConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            keys: Arc::new(SigningKeys {
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
            }),
            same_site: same_site(config.cookie_same_site),
            secure: config.secure_cookies(),
            bcrypt_rounds: config.bcrypt_rounds,
        }
    }

    pub fn issue_token(&self, user: &User) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
            iat: now,
            exp: now + TOKEN_TTL_HOURS * 3600,
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.keys.encoding)?)
    }

    pub fn decode(&self, token: &str) -> AppResult<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.keys.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|err| {
                tracing::debug!(error = %err, "rejected access token");
                AppError::Forbidden("Invalid or expired token".to_string())
            })
    }

    pub fn session_cookie(&self, token: String) -> Cookie<'static> {
        Cookie::build((AUTH_COOKIE, token))
            .http_only(true)
            .same_site(self.same_site)
            .secure(self.secure)
            .path("/")
            .max_age(time::Duration::hours(TOKEN_TTL_HOURS))
            .build()
    }

    pub fn cleared_session_cookie(&self) -> Cookie<'static> {
        Cookie::build(AUTH_COOKIE)
            .http_only(true)
            .same_site(self.same_site)
            .secure(self.secure)
            .path("/")
            .build()
    }

    pub async fn hash_password(&self, plain: String) -> AppResult<String> {
        let rounds = self.bcrypt_rounds;
        Ok(tokio::task::spawn_blocking(move || bcrypt::hash(plain, rounds)).await??)
    }

    pub async fn verify_password(&self, plain: String, hash: String) -> AppResult<bool> {
        Ok(tokio::task::spawn_blocking(move || bcrypt::verify(plain, &hash)).await??)
    }

    /// Returns the public view of the user and a signed token.
    pub async fn login(&self, store: &JsonStore, request: LoginRequest) -> AppResult<(PublicUser, String)> {
        let username = request.username.filter(|value| !value.is_empty());
        let password = request.password.filter(|value| !value.is_empty());
        let (Some(username), Some(password)) = (username, password) else {
            return Err(AppError::BadRequest("Username and password are required".to_string()));
        };

        let invalid = || AppError::Unauthorized("Invalid username or password".to_string());
        let Some(user) = store.user_by_username(&username).await else {
            tracing::warn!(username = %username, "login attempt for unknown user");
            return Err(invalid());
        };
        if !self.verify_password(password, user.password.clone()).await? {
            tracing::warn!(user_id = user.id, "login attempt with wrong password");
            return Err(invalid());
        }

        let token = self.issue_token(&user)?;
        tracing::info!(user_id = user.id, role = user.role.as_str(), "user logged in");
        Ok((user.public(), token))
    }

    /// Any failure yields `{valid: false}`.
    pub async fn verify(&self, store: &JsonStore, token: Option<String>) -> VerifyResponse {
        let invalid = VerifyResponse { valid: false, user: None };
        let Some(token) = token else {
            return invalid;
        };
        let Ok(claims) = self.decode(&token) else {
            return invalid;
        };
        if store.user_by_id(claims.id).await.is_none() {
            tracing::debug!(user_id = claims.id, "token references a missing user");
            return invalid;
        }
        VerifyResponse {
            valid: true,
            user: Some(claims.user()),
        }
    }

    /// Creates the configured admin on first boot.
    pub async fn ensure_admin(&self, store: &JsonStore, username: &str, password: &str) -> AppResult<()> {
        if store.has_users().await {
            return Ok(());
        }
        let hash = self.hash_password(password.to_string()).await?;
        if let Some(user) = store.seed_admin_if_empty(username.to_string(), hash).await? {
            tracing::info!(user_id = user.id, username = %user.username, "seeded admin user");
        }
        Ok(())
    }
}

pub(crate) fn same_site(policy: SameSitePolicy) -> SameSite {
    match policy {
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::None => SameSite::None,
    }
}

/// Token from the `authToken` cookie, else `Authorization: Bearer`.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(AUTH_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

/// Any authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AuthService: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = token_from_headers(&parts.headers) else {
            return Err(AppError::Unauthorized("Access token required".to_string()));
        };
        let auth = AuthService::from_ref(state);
        auth.decode(&token).map(AuthUser)
    }
}

/// An authenticated caller with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub Claims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    AuthService: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthUser(claims) = AuthUser::from_request_parts(parts, state).await?;
        if !claims.is_admin() {
            tracing::warn!(user_id = claims.id, "non-admin attempted an admin operation");
            return Err(AppError::Forbidden("Admin access required".to_string()));
        }
        Ok(AdminUser(claims))
    }
}
