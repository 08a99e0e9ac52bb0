use std::sync::Arc;

use log::info;
use rollcall_sync::{open_store, HubConfig, StoreSettings, SyncHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting roll-call hub...");

    let config = HubConfig::from_env()?;
    let store_settings = StoreSettings::from_env()?;
    let store = open_store(&store_settings, config.payload_mode)?;

    info!(
        "Payload mode {:?}, rate limit {} msgs / {:?}",
        config.payload_mode, config.rate_limit.capacity, config.rate_limit.window
    );

    let hub = Arc::new(SyncHub::new(config, store));
    tokio::select! {
        result = Arc::clone(&hub).run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = hub.stats().await;
            info!(
                "Shutting down: {} connections served, {} saves applied",
                stats.total_connections, stats.saves_applied
            );
        }
    }
    Ok(())
}
