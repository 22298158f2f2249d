//! Cluster Registry
//!
//! Tracks the services of this process, discovers the rest of the cluster through the
//! shared status table, and owns the replication links between them.
//!
//! ## Registration
//!
//! ```text
//! register(service, endpoint)
//!   1. status table: Initializing
//!   2. service.initialize(cluster)
//!   3. cache as local host
//!   4. status table: Up
//!   5. Replicator pair (peer → service, service → peer) for every known peer
//! ```
//!
//! `deregister` reverses this: links touching the service are closed, the host is
//! forgotten and marked Down.
//!
//! ## Remote Hosts
//!
//! Hosts registered by other processes are read from the status table lazily and kept
//! in a TTL + LRU cache, so `get_services` does not hit the table on every relay.
//! Hosts that are not Up are skipped.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use feedhouse_core::ServerId;
use feedhouse_observability::metrics;
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{FeedError, Result};
use crate::remote::ServiceConnector;
use crate::replicator::{LinkState, Replicator, ReplicatorStats};
use crate::services::FeedService;
use crate::status::{HostStatus, StatusEntry, StatusTable};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub host_cache_ttl: Duration,
    pub host_cache_capacity: usize,
    /// Long-poll timeout of every replication link
    pub watch_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

impl From<&NodeConfig> for ClusterConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            host_cache_ttl: config.host_cache_ttl(),
            host_cache_capacity: config.host_cache_capacity,
            watch_timeout: config.watch_timeout(),
        }
    }
}

/// Narrows `get_services`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFilter {
    Exclude(ServerId),
    LocalOnly,
    RemoteOnly,
}

#[derive(Clone)]
struct LocalHost {
    service: Arc<dyn FeedService>,
    endpoint: String,
}

/// Cache entry with TTL
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct RemoteHosts {
    hosts: LruCache<ServerId, CacheEntry<Arc<dyn FeedService>>>,
    refreshed_at: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostDiagnostics {
    pub server_id: ServerId,
    pub endpoint: String,
    pub status: HostStatus,
    pub local: bool,
}

/// Snapshot of hosts and replication links
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDiagnostics {
    pub hosts: Vec<HostDiagnostics>,
    pub links: Vec<ReplicatorStats>,
}

impl ClusterDiagnostics {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FeedError::Server(format!("diagnostics: {e}")))
    }
}

pub struct Cluster {
    config: ClusterConfig,
    status: Arc<dyn StatusTable>,
    connector: Arc<dyn ServiceConnector>,
    local: RwLock<HashMap<ServerId, LocalHost>>,
    remote: tokio::sync::Mutex<RemoteHosts>,
    links: Mutex<Vec<Arc<Replicator>>>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        status: Arc<dyn StatusTable>,
        connector: Arc<dyn ServiceConnector>,
    ) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(config.host_cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);

        Arc::new(Self {
            config,
            status,
            connector,
            local: RwLock::new(HashMap::new()),
            remote: tokio::sync::Mutex::new(RemoteHosts {
                hosts: LruCache::new(capacity),
                refreshed_at: None,
            }),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Join `service` to the cluster and link it with every known peer
    pub async fn register(
        self: &Arc<Self>,
        service: Arc<dyn FeedService>,
        endpoint: &str,
    ) -> Result<()> {
        let server_id = service.server_id();

        self.set_status(&server_id, endpoint, HostStatus::Initializing)
            .await?;
        service.initialize(Arc::clone(self)).await?;

        self.local_hosts_mut().insert(
            server_id.clone(),
            LocalHost {
                service: Arc::clone(&service),
                endpoint: endpoint.to_string(),
            },
        );
        self.remote.lock().await.hosts.pop(&server_id);

        self.set_status(&server_id, endpoint, HostStatus::Up).await?;

        let peers = self
            .get_services(&[ServiceFilter::Exclude(server_id.clone())])
            .await?;
        let mut created = 0;
        for peer in &peers {
            created += self.link(Arc::clone(peer), Arc::clone(&service));
            created += self.link(Arc::clone(&service), Arc::clone(peer));
        }

        metrics::HOSTS_REGISTERED.set(self.local_hosts().len() as i64);
        info!(
            server_id = %server_id,
            endpoint = %endpoint,
            peers = peers.len(),
            links = created,
            "Registered service"
        );

        Ok(())
    }

    /// Start a link from `source` to `target` unless one exists
    fn link(&self, source: Arc<dyn FeedService>, target: Arc<dyn FeedService>) -> usize {
        let source_id = source.server_id();
        let target_id = target.server_id();

        let mut links = self.lock_links();
        let exists = links
            .iter()
            .any(|l| l.source_id() == &source_id && l.target_id() == &target_id);
        if exists {
            return 0;
        }

        let replicator = Replicator::new(source, target, self.config.watch_timeout);
        replicator.start();
        links.push(replicator);
        1
    }

    /// Close the service's links, forget it and mark it Down
    pub async fn deregister(&self, service: &dyn FeedService) -> Result<()> {
        let server_id = service.server_id();

        let closed: Vec<Arc<Replicator>> = {
            let mut links = self.lock_links();
            let (touching, rest): (Vec<_>, Vec<_>) =
                links.drain(..).partition(|l| l.involves(&server_id));
            *links = rest;
            touching
        };
        for link in &closed {
            link.close();
        }

        let endpoint = self
            .local_hosts_mut()
            .remove(&server_id)
            .map(|host| host.endpoint);
        self.remote.lock().await.hosts.pop(&server_id);

        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => self.endpoint_of(&server_id).await?.unwrap_or_default(),
        };
        self.set_status(&server_id, &endpoint, HostStatus::Down)
            .await?;

        metrics::HOSTS_REGISTERED.set(self.local_hosts().len() as i64);
        info!(server_id = %server_id, links_closed = closed.len(), "Deregistered service");

        Ok(())
    }

    /// Known services, local first, each list ordered by server id
    pub async fn get_services(
        &self,
        filters: &[ServiceFilter],
    ) -> Result<Vec<Arc<dyn FeedService>>> {
        let excluded = |id: &ServerId| {
            filters
                .iter()
                .any(|f| matches!(f, ServiceFilter::Exclude(x) if x == id))
        };
        let local_only = filters.contains(&ServiceFilter::LocalOnly);
        let remote_only = filters.contains(&ServiceFilter::RemoteOnly);

        let mut services: Vec<(ServerId, Arc<dyn FeedService>)> = Vec::new();

        if !remote_only {
            let mut local: Vec<_> = self
                .local_hosts()
                .iter()
                .filter(|(id, _)| !excluded(id))
                .map(|(id, host)| (id.clone(), Arc::clone(&host.service)))
                .collect();
            local.sort_by(|a, b| a.0.cmp(&b.0));
            services.extend(local);
        }

        if !local_only {
            let mut remote: Vec<_> = self
                .remote_hosts()
                .await?
                .into_iter()
                .filter(|(id, _)| !excluded(id))
                .collect();
            remote.sort_by(|a, b| a.0.cmp(&b.0));
            services.extend(remote);
        }

        Ok(services.into_iter().map(|(_, service)| service).collect())
    }

    pub async fn get_service(&self, server_id: &ServerId) -> Result<Arc<dyn FeedService>> {
        if let Some(host) = self.local_hosts().get(server_id) {
            return Ok(Arc::clone(&host.service));
        }

        self.remote_hosts()
            .await?
            .into_iter()
            .find(|(id, _)| id == server_id)
            .map(|(_, service)| service)
            .ok_or_else(|| FeedError::ServiceNotFound(server_id.clone()))
    }

    /// Remote hosts that are Up, refreshing from the status table once the TTL passes
    async fn remote_hosts(&self) -> Result<Vec<(ServerId, Arc<dyn FeedService>)>> {
        let mut remote = self.remote.lock().await;

        let stale = remote
            .refreshed_at
            .map_or(true, |at| at.elapsed() >= self.config.host_cache_ttl);

        if stale {
            let entries = self.status_entries().await?;
            remote.hosts.clear();

            for entry in entries {
                let is_local = self.local_hosts().contains_key(&entry.server_id);
                if entry.status != HostStatus::Up || is_local {
                    continue;
                }
                match self.connector.connect(&entry.endpoint).await {
                    Ok(service) => {
                        remote.hosts.put(
                            entry.server_id.clone(),
                            CacheEntry::new(service, self.config.host_cache_ttl),
                        );
                    }
                    Err(e) => {
                        warn!(
                            server_id = %entry.server_id,
                            endpoint = %entry.endpoint,
                            error = %e,
                            "Could not connect to host"
                        );
                    }
                }
            }

            remote.refreshed_at = Some(Instant::now());
            debug!(hosts = remote.hosts.len(), "Refreshed remote hosts");
        }

        Ok(remote
            .hosts
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.value)))
            .collect())
    }

    /// Hosts in the status table plus the state of every link
    pub async fn diagnostics(&self) -> Result<ClusterDiagnostics> {
        let entries = self.status_entries().await?;

        let local = self.local_hosts();
        let hosts = entries
            .into_iter()
            .map(|entry| HostDiagnostics {
                local: local.contains_key(&entry.server_id),
                server_id: entry.server_id,
                endpoint: entry.endpoint,
                status: entry.status,
            })
            .collect();
        drop(local);

        let links = self.lock_links().iter().map(|l| l.stats()).collect();

        Ok(ClusterDiagnostics { hosts, links })
    }

    /// Restart every failed link; returns how many were restarted
    pub fn restart_failed_links(&self) -> usize {
        let links = self.lock_links();
        let mut restarted = 0;
        for link in links.iter() {
            if link.stats().state == LinkState::Failed {
                link.restart();
                restarted += 1;
            }
        }
        if restarted > 0 {
            info!(restarted, "Restarted failed replication links");
        }
        restarted
    }

    /// Deregister every local service
    pub async fn shutdown(&self) -> Result<()> {
        let services: Vec<Arc<dyn FeedService>> = self
            .local_hosts()
            .values()
            .map(|host| Arc::clone(&host.service))
            .collect();

        for service in services {
            self.deregister(service.as_ref()).await?;
        }
        Ok(())
    }

    async fn set_status(
        &self,
        server_id: &ServerId,
        endpoint: &str,
        status: HostStatus,
    ) -> Result<()> {
        let mut session = self.status.open().await?;
        session.set_status(server_id, endpoint, status);
        session.close().await?;
        debug!(server_id = %server_id, status = %status, "Host status changed");
        Ok(())
    }

    async fn status_entries(&self) -> Result<Vec<StatusEntry>> {
        let session = self.status.open().await?;
        let entries = session.entries();
        session.close().await?;
        Ok(entries)
    }

    async fn endpoint_of(&self, server_id: &ServerId) -> Result<Option<String>> {
        Ok(self
            .status_entries()
            .await?
            .into_iter()
            .find(|entry| &entry.server_id == server_id)
            .map(|entry| entry.endpoint))
    }

    fn local_hosts(&self) -> RwLockReadGuard<'_, HashMap<ServerId, LocalHost>> {
        self.local.read().unwrap_or_else(|e| e.into_inner())
    }

    fn local_hosts_mut(&self) -> RwLockWriteGuard<'_, HashMap<ServerId, LocalHost>> {
        self.local.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_links(&self) -> MutexGuard<'_, Vec<Arc<Replicator>>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("local_hosts", &self.local_hosts().len())
            .field("links", &self.lock_links().len())
            .finish()
    }
}
