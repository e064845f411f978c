use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// JSON logs roll daily into `LOG_DIR/server.log`; outside production a
/// readable copy also goes to stdout. `RUST_LOG` overrides `LOG_LEVEL`.
pub fn init(config: &AppConfig) -> AppResult<()> {
    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = (!config.environment.is_production())
        .then(|| tracing_subscriber::fmt::layer().with_target(false).compact());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
        .with(console)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
