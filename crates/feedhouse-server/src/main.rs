//! FeedHouse Node
//!
//! Boots an in-process FeedHouse cluster, runs a post workload against its first node
//! and reports once every node holds every message.
//!
//! ## Configuration
//! All configuration is done via environment variables:
//!
//! ### Cluster
//! - `FEEDHOUSE_NODES`: Number of nodes to start (default: 3)
//! - `FEEDHOUSE_SERVER_ID`: Id prefix of the nodes (default: random UUID)
//!
//! ### Workload
//! - `FEEDHOUSE_WORKLOAD_MESSAGES`: Messages posted to the first node (default: 100)
//! - `FEEDHOUSE_WORKLOAD_FEEDS`: Comma separated feed paths (default: /demo/orders,/demo/payments)
//! - `FEEDHOUSE_WORKLOAD_MAX_DELAY_MS`: Upper bound of the random pause between posts (default: 5)
//!
//! ### Node Settings
//! See `NodeConfig::from_env()` for timeouts, host cache and buffer sizing.
//!
//! ## Logging
//! Logging is controlled via the `RUST_LOG` environment variable:
//! ```bash
//! RUST_LOG=debug cargo run -p feedhouse-server    # Detailed logs
//! RUST_LOG=info cargo run -p feedhouse-server     # Standard logs (default)
//! ```

use std::sync::Arc;
use std::time::Duration;

use feedhouse_core::{FeedPath, Message, MessageType};
use feedhouse_server::{
    Cluster, ClusterConfig, FeedService, InProcessNetwork, LocalFeedService, MemoryStatusTable,
    NodeConfig,
};
use rand::Rng;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    feedhouse_observability::init();

    // Configuration
    let config = NodeConfig::from_env()?;

    let node_count: usize = std::env::var("FEEDHOUSE_NODES")
        .unwrap_or_else(|_| "3".to_string())
        .parse()?;

    let message_count: usize = std::env::var("FEEDHOUSE_WORKLOAD_MESSAGES")
        .unwrap_or_else(|_| "100".to_string())
        .parse()?;

    let max_delay_ms: u64 = std::env::var("FEEDHOUSE_WORKLOAD_MAX_DELAY_MS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()?;

    let feeds: Vec<FeedPath> = std::env::var("FEEDHOUSE_WORKLOAD_FEEDS")
        .unwrap_or_else(|_| "/demo/orders,/demo/payments".to_string())
        .split(',')
        .map(|path| path.trim().parse())
        .collect::<Result<_, _>>()?;

    if node_count == 0 || feeds.is_empty() {
        return Err("FEEDHOUSE_NODES and FEEDHOUSE_WORKLOAD_FEEDS must not be empty".into());
    }

    // Build the cluster
    let status = Arc::new(MemoryStatusTable::new());
    let network = Arc::new(InProcessNetwork::new());
    let cluster = Cluster::new(ClusterConfig::from(&config), status, network.clone());

    let mut nodes: Vec<Arc<LocalFeedService>> = Vec::with_capacity(node_count);
    let mut reclaim_handles = Vec::with_capacity(node_count);
    let mut endpoints = Vec::with_capacity(node_count);

    for index in 0..node_count {
        let node_config = config.with_server_id(format!("{}-{}", config.server_id, index));
        let endpoint = node_config.endpoint();
        let node = Arc::new(LocalFeedService::new(node_config)?);

        network.bind(endpoint.clone(), node.clone());
        cluster.register(node.clone(), &endpoint).await?;
        reclaim_handles.push(node.start_background_reclaim());
        nodes.push(node);
        endpoints.push(endpoint);
    }

    tracing::info!(
        nodes = node_count,
        messages = message_count,
        feeds = feeds.len(),
        "FeedHouse cluster started"
    );

    // Run the workload against the first node
    let writer = nodes[0].clone();
    for i in 0..message_count {
        let path = feeds[i % feeds.len()].clone();
        writer
            .post(Message::new(path, format!("message-{i}")).with_header("sequence", i))
            .await?;

        let delay = rand::thread_rng().gen_range(0..=max_delay_ms);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    tracing::info!(messages = message_count, "Workload posted, waiting for replication");

    // Wait until every node holds the workload
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let converged = loop {
        let mut counts = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let messages = node.sync(&FeedPath::root()).await?;
            counts.push(
                messages
                    .iter()
                    .filter(|m| m.kind == MessageType::Message)
                    .count(),
            );
        }

        if counts.iter().all(|&count| count == message_count) {
            break true;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(?counts, "Cluster did not converge");
            break false;
        }
        cluster.restart_failed_links();
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    if converged {
        tracing::info!(nodes = node_count, messages = message_count, "Cluster converged");
    }

    let diagnostics = cluster.diagnostics().await?;
    tracing::info!("Cluster diagnostics:\n{}", diagnostics.to_json()?);

    match feedhouse_observability::gather_text() {
        Ok(text) => tracing::debug!("Metrics:\n{}", text),
        Err(e) => tracing::warn!(error = %e, "Could not gather metrics"),
    }

    // Wait for shutdown signal
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tracing::info!("Press Ctrl+C to stop");
    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }

    cluster.shutdown().await?;
    for endpoint in &endpoints {
        network.unbind(endpoint);
    }
    for node in &nodes {
        node.shutdown();
    }
    for handle in reclaim_handles {
        handle.abort();
    }

    tracing::info!("FeedHouse cluster shut down gracefully");

    Ok(())
}
