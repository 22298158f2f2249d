use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedhouse_core::{Ack, FeedPath, Message, MessageClock, ServerId, Timestamp};
use feedhouse_storage::{BufferPool, PoolStats};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cluster::Cluster;
use crate::config::NodeConfig;
use crate::engine::FeedEngine;
use crate::error::{FeedError, Result};
use crate::search::{MessageFilter, PendingSearch, SearchRequest};
use crate::tree::FeedTree;

/// Consumer of a `listen` delivery; runs once on the node's executor
pub type ListenCallback = Box<dyn FnOnce(Vec<Message>) + Send + 'static>;

/// Operations a FeedHouse node offers to clients and to other nodes
#[async_trait]
pub trait FeedService: Send + Sync {
    fn server_id(&self) -> ServerId;

    /// The cluster this node was initialized with
    fn cluster(&self) -> Option<Arc<Cluster>>;

    async fn initialize(&self, cluster: Arc<Cluster>) -> Result<()>;

    /// Store a new message; its path names the target feed
    async fn post(&self, message: Message) -> Result<Ack>;

    /// Store a message first stored on another node
    async fn replicate(&self, message: Message) -> Result<Ack>;

    fn search(&self, request: SearchRequest) -> PendingSearch;

    /// Long-poll for messages `target` still has to replicate from this node
    fn watch(&self, target: &ServerId, from: Timestamp, timeout: Duration) -> PendingSearch;

    /// Everything held for `path` and its subtree, relaying what was trimmed
    async fn sync(&self, path: &FeedPath) -> Result<Vec<Message>>;

    /// Deliver messages after `from` in `path` now, or on its next write
    ///
    /// Returns `true` if the callback was scheduled right away.
    async fn listen(&self, path: &FeedPath, from: Timestamp, callback: ListenCallback)
        -> Result<bool>;
}

/// FeedService backed by this process's feed tree
///
/// Creating one requires a running Tokio runtime: resolution work and feed timers run
/// on the runtime that was current at construction.
pub struct LocalFeedService {
    engine: Arc<FeedEngine>,
    pool: Arc<BufferPool>,
}

impl LocalFeedService {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let executor = Handle::try_current()
            .map_err(|e| FeedError::Server(format!("no Tokio runtime: {e}")))?;

        let pool = Arc::new(BufferPool::new(config.buffer.clone()));
        let tree = FeedTree::new(Arc::clone(&pool), Arc::new(MessageClock::new()));

        info!(
            server_id = %config.server_id,
            bucket_size = config.buffer.bucket_size,
            max_pool_size = config.buffer.max_pool_size,
            "Created feed service"
        );

        Ok(Self {
            engine: Arc::new(FeedEngine::new(config, tree, executor)),
            pool,
        })
    }

    pub fn engine(&self) -> &Arc<FeedEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Periodically hand buckets back once the pool is over budget
    pub fn start_background_reclaim(&self) -> JoinHandle<()> {
        let interval = self.pool.config().reclaim_interval();
        Arc::clone(&self.pool).start_background_reclaim(interval)
    }

    /// Stop accepting work and resolve outstanding long-polls as timed out
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

#[async_trait]
impl FeedService for LocalFeedService {
    fn server_id(&self) -> ServerId {
        self.engine.server_id().clone()
    }

    fn cluster(&self) -> Option<Arc<Cluster>> {
        self.engine.cluster()
    }

    async fn initialize(&self, cluster: Arc<Cluster>) -> Result<()> {
        if self.engine.is_closed() {
            return Err(FeedError::Shutdown);
        }
        self.engine.set_cluster(&cluster);
        Ok(())
    }

    async fn post(&self, message: Message) -> Result<Ack> {
        self.engine.post(message).await
    }

    async fn replicate(&self, message: Message) -> Result<Ack> {
        self.engine.replicate(message).await
    }

    fn search(&self, request: SearchRequest) -> PendingSearch {
        self.engine.search(request)
    }

    fn watch(&self, target: &ServerId, from: Timestamp, timeout: Duration) -> PendingSearch {
        let request = SearchRequest::new(FeedPath::root())
            .after(from)
            .with_relay(false)
            .with_filter(MessageFilter::replication(target))
            .requested_by(target.clone())
            .wait(timeout);

        self.engine.search(request)
    }

    async fn sync(&self, path: &FeedPath) -> Result<Vec<Message>> {
        let outcome = self.engine.search(SearchRequest::new(path.clone())).await?;
        Ok(outcome.messages)
    }

    async fn listen(
        &self,
        path: &FeedPath,
        from: Timestamp,
        callback: ListenCallback,
    ) -> Result<bool> {
        self.engine.listen(path, from, callback).await
    }
}

impl std::fmt::Debug for LocalFeedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFeedService")
            .field("engine", &self.engine)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchOutcome;
    use feedhouse_core::MessageType;

    fn service(id: &str) -> LocalFeedService {
        LocalFeedService::new(NodeConfig::default().with_server_id(id)).unwrap()
    }

    fn path(s: &str) -> FeedPath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_post_stores_message_and_ack() {
        let node = service("a");
        let ack = node
            .post(Message::new(path("/orders"), "one").with_header("k", "v"))
            .await
            .unwrap();

        assert_eq!(ack.server_id, ServerId::new("a"));
        assert_eq!(ack.path.feed_path(), path("/orders"));
        assert!(ack.path.message_id().is_some());

        let stored = node.sync(&path("/orders")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].kind, MessageType::Message);
        assert_eq!(stored[0].timestamp, ack.timestamp);
        assert_eq!(stored[0].headers["k"], "v");
        assert_eq!(stored[1].kind, MessageType::Ack);
        assert_eq!(stored[1].path, stored[0].path);
        assert!(stored[1].timestamp > stored[0].timestamp);
    }

    #[tokio::test]
    async fn test_post_rejects_root_and_acks() {
        let node = service("a");

        let err = node.post(Message::new(FeedPath::root(), "x")).await.unwrap_err();
        assert_eq!(err.kind(), crate::remote::ErrorKind::InvalidPath);

        let err = node
            .post(Message::new(path("/orders"), "x").with_kind(MessageType::Ack))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::remote::ErrorKind::InvalidMessage);
    }

    #[tokio::test]
    async fn test_replicate_ack_gets_no_twin() {
        let node = service("b");
        let mut ack = Message::new(path("/orders/~~m1"), "").with_kind(MessageType::Ack);
        ack.server_id = Some(ServerId::new("a"));

        node.replicate(ack).await.unwrap();

        let stored = node.sync(&path("/orders")).await.unwrap();
        assert_eq!(stored.len(), 1);
        let origin = stored[0].remote.as_ref().unwrap();
        assert_eq!(origin.server_id, ServerId::new("a"));
        assert_eq!(origin.message_id, "m1");
        assert_eq!(stored[0].server_id, Some(ServerId::new("b")));
    }

    #[tokio::test]
    async fn test_replicated_messages_are_not_watched() {
        let node = service("b");
        let mut message = Message::new(path("/orders/~~m1"), "x");
        message.server_id = Some(ServerId::new("a"));
        node.replicate(message).await.unwrap();

        let outcome: SearchOutcome = node
            .watch(&ServerId::new("c"), Timestamp::EPOCH, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn test_search_on_message_path_fails() {
        let node = service("a");
        let err = node
            .search(SearchRequest::new(path("/orders/~~m1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::remote::ErrorKind::InvalidPath);
    }

    #[tokio::test]
    async fn test_listen_delivers_on_next_write() {
        let node = service("a");
        let (tx, rx) = tokio::sync::oneshot::channel();

        let immediate = node
            .listen(
                &path("/orders"),
                Timestamp::EPOCH,
                Box::new(move |messages: Vec<Message>| {
                    let _ = tx.send(messages.len());
                }),
            )
            .await
            .unwrap();
        assert!(!immediate);

        node.post(Message::new(path("/orders"), "x")).await.unwrap();

        // Delivered after the message write, before its ACK
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let node = service("a");
        node.shutdown();

        let err = node.post(Message::new(path("/orders"), "x")).await.unwrap_err();
        assert!(matches!(err, FeedError::Shutdown));
    }
}
