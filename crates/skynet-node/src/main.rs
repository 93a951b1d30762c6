//! # skynet-node
//!
//! Headless Skynet node.
//!
//! Joins every configured topic, announces itself on the control topic and
//! keeps the conversation store and peer table up to date until Ctrl+C.
//! Configuration comes from `SKYNET_*` environment variables; see
//! `skynet_client::ClientConfig`.

use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use skynet_client::{spawn_router, ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skynet_net=debug,skynet_client=debug")),
        )
        .init();

    info!("Starting Skynet node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    let identity = config.identity();
    info!(?config, "Loaded configuration");
    info!(
        participant = %identity.participant_id(),
        display_name = identity.display_name.as_deref().unwrap_or("-"),
        topics = ?config.subscribed_topics(),
        "Local identity"
    );

    // -----------------------------------------------------------------------
    // 3. Spawn the router and join the topics
    // -----------------------------------------------------------------------
    let router = spawn_router(config);

    // A topic that cannot bind does not keep the others down.
    if let Err(e) = router.start().await {
        warn!(error = %e, "Some channels failed to start");
    }

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Log every published state change
    let mut updates = router.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            debug!(
                conversations = snapshot.conversations.len(),
                unread = snapshot.unread_count(),
                peers = snapshot.peers.len(),
                "State updated"
            );
        }
    });

    // Periodic status line (every minute)
    let status = router.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let snapshot = status.snapshot();
            info!(
                conversations = snapshot.conversations.len(),
                peers = snapshot.peers.len(),
                online = snapshot.online_peers().count(),
                "Node status"
            );
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    router.stop().await?;

    // Final state for whoever collects the logs.
    match router.snapshot().to_json() {
        Ok(json) => debug!(snapshot = %json, "Final state"),
        Err(e) => warn!(error = %e, "Failed to serialize final state"),
    }

    router.shutdown().await;
    Ok(())
}
