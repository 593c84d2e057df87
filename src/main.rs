mod bot;
mod config;
mod platform;
mod server;
mod update;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;
use crate::platform::telegram::TelegramMessenger;

const USAGE: &str = "usage: orion-bot [set-webhook <base_url>]";

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the process environment is used as-is.
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orion_bot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::var("ORION_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        "Bot token available: {}",
        if config.telegram.has_token() { "Yes" } else { "No (empty)" }
    );
    info!("  Environment: {}", config.environment_label());
    info!("  Port: {}", config.server.port);

    let messenger = TelegramMessenger::new(&config.telegram)?;
    bot::resolve_username(&mut config.telegram, &messenger).await;
    let state = Arc::new(AppState::new(config, Arc::new(messenger)));

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => server::serve(state).await,
        Some("set-webhook") => {
            let Some(base_url) = args.next() else {
                bail!(USAGE);
            };
            if !bot::register_webhook(&state, &base_url).await {
                error!("Webhook registration failed");
                std::process::exit(1);
            }
            Ok(())
        }
        Some(other) => bail!("Unknown command: {}\n{}", other, USAGE),
    }
}
