use anyhow::Context;
use culture_center::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    culture_center::telemetry::init(&config).context("failed to initialize logging")?;
    culture_center::serve(config).await.context("server error")?;
    Ok(())
}
