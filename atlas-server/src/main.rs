//! atlas-server: runs the WebSocket and HTTP transports over one hub.

use std::sync::Arc;

use atlas_sync::{
    ApiState, ConnectionRegistry, DocumentCache, DocumentStore, ServerConfig, SyncHub, SyncServer,
    UserDirectory,
};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting atlas-server (http {}, ws {}, data {})",
        config.http_addr,
        config.ws_addr,
        config.storage.path.display()
    );

    let users = Arc::new(UserDirectory::with_users(config.seed_users.clone()));
    if users.is_empty() {
        log::warn!("No users configured; set ATLAS_USERS to allow document creation");
    } else {
        info!("Registered {} users", users.len());
    }

    let store = Arc::new(DocumentStore::open(config.storage.clone(), users.clone())?);
    let hub = Arc::new(
        SyncHub::start(
            store.clone(),
            Arc::new(DocumentCache::new()),
            Arc::new(ConnectionRegistry::new(config.outbox_capacity)),
        )
        .await?,
    );

    let ws_server = SyncServer::new(hub.clone(), config.send_timeout);
    let api = ApiState {
        hub,
        identity: users,
    };

    tokio::select! {
        result = ws_server.run(&config.ws_addr) => {
            if let Err(e) = result {
                log::error!("WebSocket server stopped: {e}");
            }
        }
        result = atlas_sync::http::serve(&config.http_addr, api) => {
            if let Err(e) = result {
                log::error!("HTTP server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    let stats = ws_server.stats().await;
    info!(
        "Served {} connections, {} messages, {} broadcasts ({} delivery failures)",
        stats.total_connections,
        stats.messages_received,
        stats.broadcasts_sent,
        stats.delivery_failures
    );
    store.sync()?;
    Ok(())
}
