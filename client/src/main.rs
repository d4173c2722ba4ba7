//! Listsync daemon - keeps a local list database in sync with the server.
//!
//! Runs until Ctrl-C. Without `LISTSYNC_AUTH_TOKEN` it stays offline and only
//! serves the local store.

use listsync_client::{
    AuthToken, Config, HttpRemoteApi, SqliteStore, SyncClient, SyncEvent, WsTransport,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "listsync_client=debug,listsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting listsync against {} (realtime {})",
        config.api_url,
        config.realtime_url
    );

    let store = SqliteStore::connect(&config.database_url).await?;
    let token = config.auth_token.as_deref().map(AuthToken::new);

    let api = HttpRemoteApi::new(
        config.api_url.clone(),
        token.clone().unwrap_or_else(|| AuthToken::new("")),
        &config.connection,
    )?;
    let transport = WsTransport::new(config.realtime_url.clone(), config.health_url());

    let mut client = SyncClient::new(
        Arc::new(store),
        Arc::new(api),
        Arc::new(transport),
        config.sync.clone(),
        config.connection.clone(),
    );
    client.start().await?;

    match token {
        Some(token) => client.connect(token),
        None => tracing::warn!("No LISTSYNC_AUTH_TOKEN set, running offline"),
    }

    let mut events = client.subscribe();
    let pending = client.pending_change_count().await?;
    tracing::info!(pending, "Ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::DrainCompleted(report)) => {
                    tracing::info!(applied = report.applied, failed = report.failed, "Sync pass done")
                }
                Ok(SyncEvent::ChangesFailed { entity_id, change_ids, error }) => {
                    tracing::error!(entity_id = %entity_id, ?change_ids, "Changes need attention: {}", error)
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down");
    client.stop().await;
    Ok(())
}
