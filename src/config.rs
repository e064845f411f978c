use crate::errors::{AppError, AppResult};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "dev-secret-change-in-production";
const DEV_ADMIN_USERNAME: &str = "admin";
const DEV_ADMIN_PASSWORD: &str = "admin123";
const DEV_CORS_ORIGINS: &[&str] = &["http://localhost:5173", "http://127.0.0.1:5173"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Lax,
    Strict,
    None,
}

impl SameSitePolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "lax" => Some(Self::Lax),
            "strict" => Some(Self::Strict),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub auth_max: u32,
    pub mutation_max: u32,
    pub document_max: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(900_000),
            auth_max: 20,
            mutation_max: 50,
            document_max: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub port: u16,
    #[serde(skip_serializing)]
    pub jwt_secret: String,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub data_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub cookie_same_site: SameSitePolicy,
    pub uploads_require_auth: bool,
    pub cors_origins: Vec<String>,
    pub bcrypt_rounds: u32,
    pub rate_limits: RateLimitSettings,
    pub admin_username: String,
    #[serde(skip_serializing)]
    pub admin_password: String,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let environment = match var("APP_ENV").as_deref() {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        };

        let jwt_secret = match var("JWT_SECRET") {
            Some(secret) => secret,
            None if environment.is_production() => {
                return Err(AppError::Internal(
                    "JWT_SECRET environment variable is required in production".to_string(),
                ));
            }
            None => DEV_JWT_SECRET.to_string(),
        };
        if environment.is_production() && jwt_secret.contains("dev-secret") {
            return Err(AppError::Internal(
                "Please set a strong JWT_SECRET in production".to_string(),
            ));
        }

        let cookie_same_site = match var("COOKIE_SAMESITE") {
            Some(raw) => SameSitePolicy::parse(&raw).ok_or_else(|| {
                AppError::Internal("COOKIE_SAMESITE must be one of: lax, strict, none".to_string())
            })?,
            None => SameSitePolicy::Lax,
        };

        let cors_origins = match var("CORS_ORIGIN") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect(),
            None if environment.is_production() => Vec::new(),
            None => DEV_CORS_ORIGINS.iter().map(ToString::to_string).collect(),
        };

        let (admin_username, admin_password) = match (var("ADMIN_USERNAME"), var("ADMIN_PASSWORD")) {
            (Some(username), Some(password)) => (username, password),
            _ if environment.is_production() => {
                return Err(AppError::Internal(
                    "ADMIN_USERNAME and ADMIN_PASSWORD are required in production".to_string(),
                ));
            }
            (username, password) => (
                username.unwrap_or_else(|| DEV_ADMIN_USERNAME.to_string()),
                password.unwrap_or_else(|| DEV_ADMIN_PASSWORD.to_string()),
            ),
        };

        let defaults = RateLimitSettings::default();
        let rate_limits = RateLimitSettings {
            window: Duration::from_millis(parse_or(var("RATE_LIMIT_WINDOW_MS"), 900_000)),
            auth_max: parse_or(var("RATE_LIMIT_AUTH_MAX"), defaults.auth_max),
            mutation_max: parse_or(var("RATE_LIMIT_MUTATION_MAX"), defaults.mutation_max),
            document_max: parse_or(var("RATE_LIMIT_DOCUMENT_MAX"), defaults.document_max),
        };

        Ok(Self {
            environment,
            port: parse_or(var("PORT"), 5000),
            jwt_secret,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_dir: PathBuf::from(var("LOG_DIR").unwrap_or_else(|| "logs".to_string())),
            data_dir: PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            uploads_dir: PathBuf::from(var("UPLOADS_DIR").unwrap_or_else(|| "uploads".to_string())),
            cookie_same_site,
            uploads_require_auth: var("UPLOADS_REQUIRE_AUTH").as_deref() == Some("true"),
            cors_origins,
            bcrypt_rounds: parse_or(var("BCRYPT_ROUNDS"), 10),
            rate_limits,
            admin_username,
            admin_password,
        })
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_dir.join("db.json")
    }

    /// Auth cookies must be `Secure` whenever browsers would otherwise reject them.
    pub fn secure_cookies(&self) -> bool {
        self.environment.is_production() || self.cookie_same_site == SameSitePolicy::None
    }

    /// The CSRF secret cookie is cross-site in production.
    pub fn csrf_same_site(&self) -> SameSitePolicy {
        if self.environment.is_production() {
            SameSitePolicy::None
        } else {
            self.cookie_same_site
        }
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.parse::<T>().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, Environment, SameSitePolicy};
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn development_defaults_are_usable() {
        let config = AppConfig::from_lookup(lookup(&[])).expect("dev config");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.port, 5000);
        assert_eq!(config.admin_username, "admin");
        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(config.rate_limits.mutation_max, 50);
        assert!(!config.secure_cookies());
        assert!(config.data_file().ends_with("db.json"));
    }

    #[test]
    fn production_requires_strong_secret_and_admin_credentials() {
        let missing = AppConfig::from_lookup(lookup(&[("APP_ENV", "production")]));
        assert!(missing.is_err());

        let weak = AppConfig::from_lookup(lookup(&[
            ("APP_ENV", "production"),
            ("JWT_SECRET", "dev-secret-123"),
            ("ADMIN_USERNAME", "root"),
            ("ADMIN_PASSWORD", "pw"),
        ]));
        assert!(weak.is_err());

        let config = AppConfig::from_lookup(lookup(&[
            ("APP_ENV", "production"),
            ("JWT_SECRET", "0f3c9a7e1b2d4c6f8a0b"),
            ("ADMIN_USERNAME", "root"),
            ("ADMIN_PASSWORD", "pw"),
        ]))
        .expect("prod config");
        assert!(config.secure_cookies());
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.csrf_same_site(), SameSitePolicy::None);
    }

    #[test]
    fn rejects_unknown_same_site_policy() {
        let result = AppConfig::from_lookup(lookup(&[("COOKIE_SAMESITE", "sometimes")]));
        assert!(result.is_err());
        let config = AppConfig::from_lookup(lookup(&[("COOKIE_SAMESITE", "None")])).expect("config");
        assert_eq!(config.cookie_same_site, SameSitePolicy::None);
        assert!(config.secure_cookies());
    }
}
