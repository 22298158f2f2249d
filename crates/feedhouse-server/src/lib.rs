//! FeedHouse Node
//!
//! Hierarchical, append-only message feeds held in memory and replicated between nodes.
//!
//! ## Components
//!
//! - **FeedTree / Feed**: one buffer per feed path, children linked by segment
//! - **FeedEngine**: post, replicate, search, long-poll and relay
//! - **FeedService**: the operations a node offers (`LocalFeedService`, `RemoteService`)
//! - **Replicator**: pull loop copying one node's new messages into another
//! - **Cluster**: local services, remote hosts from the status table, replication links
//!
//! ## Example
//!
//! ```ignore
//! let status = Arc::new(MemoryStatusTable::new());
//! let network = Arc::new(InProcessNetwork::new());
//! let cluster = Cluster::new(ClusterConfig::default(), status, network.clone());
//!
//! let node: Arc<dyn FeedService> = Arc::new(LocalFeedService::new(config)?);
//! network.bind("inproc://a", node.clone());
//! cluster.register(node.clone(), "inproc://a").await?;
//!
//! let ack = node.post(Message::new("/shop/orders".parse()?, payload)).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod remote;
pub mod replicator;
pub mod search;
pub mod services;
pub mod status;
pub mod tree;

pub use cluster::{Cluster, ClusterConfig, ClusterDiagnostics, HostDiagnostics, ServiceFilter};
pub use config::NodeConfig;
pub use engine::FeedEngine;
pub use error::{FeedError, Result};
pub use feed::Feed;
pub use remote::{ErrorEnvelope, ErrorKind, InProcessNetwork, RemoteService, ServiceConnector};
pub use replicator::{LinkState, Replicator, ReplicatorStats};
pub use search::{MessageFilter, PendingSearch, SearchOutcome, SearchRequest};
pub use services::{FeedService, ListenCallback, LocalFeedService};
pub use status::{HostStatus, MemoryStatusTable, StatusEntry, StatusSession, StatusTable};
pub use tree::FeedTree;
