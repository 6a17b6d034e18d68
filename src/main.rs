use chrono::Local;
use clap::Parser;
use comic_harvest::{config::Cli, info_time, process::harvest_site, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comic_harvest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let start_time = Local::now();
    let config = Cli::parse().into_config();
    harvest_site(&config).await?;
    info_time!(start_time, "Full program time:");

    Ok(())
}
