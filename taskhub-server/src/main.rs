use std::sync::Arc;

use log::{error, info};
use taskhub_core::TaskStore;
use taskhub_server::{router, AppConfig, AppState};
use taskhub_sync::HubServer;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    info!("Starting taskhub...");

    let hub_server = HubServer::bind(config.hub.clone()).await?;
    info!("Sync hub listening on ws://{}", hub_server.local_addr()?);

    let state = AppState::new(Arc::new(TaskStore::new()), hub_server.hub());
    let shutdown = hub_server.shutdown_handle();
    let hub_task = tokio::spawn(hub_server.run());

    let listener = TcpListener::bind(&config.http_addr).await?;
    info!("REST API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down sync hub");
    shutdown.shutdown().await;
    match hub_task.await {
        Ok(Err(e)) => error!("Sync hub stopped with error: {}", e),
        Err(e) => error!("Sync hub task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
