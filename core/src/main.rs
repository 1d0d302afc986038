/// Inbox daemon - runs one conversation controller and serves it over HTTP
use inbox_core::inbox_api::{self, ApiState};
use inbox_core::{Config, ConversationController, ReadStateCache, SledMessageStore};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let store = SledMessageStore::new(&data_dir, config.event_buffer)
        .map_err(|e| anyhow::anyhow!("Message store error: {}", e))?;
    let read_state = ReadStateCache::with_storage(&data_dir);

    info!("📬 Starting inbox for {}", config.user_id);
    info!("   Data dir: {}", data_dir.display());

    let controller = ConversationController::new(Arc::new(store.clone()), read_state, &config);
    if let Err(e) = controller.start().await {
        // The list stays empty until the next change event or refresh
        warn!("Initial thread load failed: {}", e);
    }

    let state = Arc::new(ApiState {
        controller: controller.clone(),
        bookings: store.bookings().clone(),
    });

    tokio::select! {
        res = inbox_api::start_inbox_api(state, config.api_addr) => {
            res.map_err(|e| anyhow::anyhow!("Inbox API error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    controller.unsubscribe().await;
    Ok(())
}
