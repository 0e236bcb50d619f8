//! Main entry point for the appointment watcher daemon.
//! Wires the persistence, API client, and engine components together and
//! runs the check loop until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use appointment_scan::{
    ChannelAlert, CheckExecutor, EngineConfig, HealthMonitor, MessageChannel, MockChannel,
    Notifier, OperatorAlert, QueueManager, TelegramChannel, TokenProvider,
};
use muenchen_api::ApiClient;
use storage::SqliteStore;

mod engine_manager;
use engine_manager::EngineManager;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("🚀 starting termin-watchd");

    let config = EngineConfig::from_env().context("invalid configuration")?;

    let db_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://bot_data.db?mode=rwc".to_string());
    let store = Arc::new(
        SqliteStore::connect(&db_url)
            .await
            .context("failed to open subscription store")?,
    );

    let api = match std::env::var("API_BASE_URL") {
        Ok(base) => ApiClient::with_base_url(base),
        Err(_) => ApiClient::new(),
    }
    .context("failed to build API client")?;
    let api = Arc::new(api);

    let channel: Arc<dyn MessageChannel> = match std::env::var("TELEGRAM_BOT_TOKEN") {
        Ok(token) => Arc::new(
            TelegramChannel::new(&token).context("failed to build Telegram channel")?,
        ),
        Err(_) => {
            warn!("TELEGRAM_BOT_TOKEN not set, messages go to the mock channel");
            Arc::new(MockChannel::default())
        }
    };

    let alert: Option<Arc<dyn OperatorAlert>> = std::env::var("ADMIN_TELEGRAM_ID")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map(|admin_id| {
            Arc::new(ChannelAlert::new(channel.clone(), admin_id)) as Arc<dyn OperatorAlert>
        });
    if alert.is_none() {
        warn!("ADMIN_TELEGRAM_ID not set, health alerts will only be logged");
    }

    let queue = Arc::new(QueueManager::new(config.queue_timeout));
    let tokens = Arc::new(TokenProvider::new(api.clone(), &config));
    let health = Arc::new(HealthMonitor::new(config.health_alert_threshold, alert));
    let notifier = Arc::new(Notifier::new(channel, &config));

    let executor = Arc::new(CheckExecutor::new(
        store,
        api,
        tokens,
        queue,
        notifier,
        health.clone(),
        config,
    ));

    let mut manager = EngineManager::new();
    manager.start(executor);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    let snapshot = health.snapshot();
    info!(
        consecutive_failures = snapshot.consecutive_failures,
        "shutdown signal received, stopping"
    );
    manager.stop().await;

    Ok(())
}
