//! Feed Tree
//!
//! All feeds of a node live in one table keyed by path. Parents are found by trimming
//! the path, children through the segment set each `Feed` keeps, so no feed owns another.
//!
//! ```text
//! "/"            ─ children {shop}
//! "/shop"        ─ children {orders, payments}
//! "/shop/orders" ─ children {}
//! ```
//!
//! Every feed gets its own `MessageBuffer`; all buffers share the node's pool and clock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use feedhouse_core::{Error as CoreError, FeedPath, MessageClock};
use feedhouse_storage::{BufferPool, MessageBuffer};

use crate::error::Result;
use crate::feed::Feed;

pub struct FeedTree {
    feeds: RwLock<HashMap<FeedPath, Arc<Feed>>>,
    pool: Arc<BufferPool>,
    clock: Arc<MessageClock>,
}

impl FeedTree {
    pub fn new(pool: Arc<BufferPool>, clock: Arc<MessageClock>) -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            pool,
            clock,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn get(&self, path: &FeedPath) -> Option<Arc<Feed>> {
        self.read().get(path).cloned()
    }

    /// The feed at `path`, creating it and any missing ancestors
    pub fn get_or_create(&self, path: &FeedPath) -> Result<Arc<Feed>> {
        if path.message_id().is_some() {
            return Err(CoreError::InvalidPath(format!("{path} names a message, not a feed")).into());
        }

        if let Some(feed) = self.get(path) {
            return Ok(feed);
        }

        let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());

        // Root first so every parent exists before its child is linked
        let mut lineage: Vec<FeedPath> = path.ancestors().collect();
        lineage.reverse();

        for current in lineage {
            if feeds.contains_key(&current) {
                continue;
            }

            let buffer = MessageBuffer::new(Arc::clone(&self.pool), Arc::clone(&self.clock));
            feeds.insert(current.clone(), Arc::new(Feed::new(current.clone(), buffer)));

            if let (Some(parent), Some(segment)) = (current.parent(), current.segments().last()) {
                if let Some(parent) = feeds.get(&parent) {
                    parent.add_child(segment.clone());
                }
            }

            tracing::debug!(feed = %current, "Created feed");
        }

        feeds
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::InvalidPath(path.to_string()).into())
    }

    /// `path` and every feed below it, parents before children
    pub fn subtree(&self, path: &FeedPath) -> Vec<Arc<Feed>> {
        let feeds = self.read();
        let mut found = Vec::new();
        let mut queue = VecDeque::from([path.clone()]);

        while let Some(current) = queue.pop_front() {
            let Some(feed) = feeds.get(&current) else {
                continue;
            };
            for segment in feed.children() {
                if let Ok(child) = current.child(segment) {
                    queue.push_back(child);
                }
            }
            found.push(Arc::clone(feed));
        }

        found
    }

    /// Existing feeds from `path` up to the root
    pub fn ancestors(&self, path: &FeedPath) -> Vec<Arc<Feed>> {
        let feeds = self.read();
        path.ancestors()
            .filter_map(|ancestor| feeds.get(&ancestor).cloned())
            .collect()
    }

    pub fn feeds(&self) -> Vec<Arc<Feed>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<FeedPath, Arc<Feed>>> {
        self.feeds.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedhouse_storage::BufferConfig;

    fn tree() -> FeedTree {
        FeedTree::new(
            Arc::new(BufferPool::new(BufferConfig::default())),
            Arc::new(MessageClock::new()),
        )
    }

    fn path(s: &str) -> FeedPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_creates_missing_ancestors() {
        let tree = tree();
        tree.get_or_create(&path("/shop/orders/eu")).unwrap();

        assert_eq!(tree.len(), 4);
        assert!(tree.get(&FeedPath::root()).is_some());
        assert!(tree.get(&path("/shop/orders")).is_some());

        let shop = tree.get(&path("/shop")).unwrap();
        assert_eq!(shop.children().len(), 1);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let tree = tree();
        let a = tree.get_or_create(&path("/a")).unwrap();
        let b = tree.get_or_create(&path("/a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_message_path_rejected() {
        let tree = tree();
        let err = tree.get_or_create(&path("/a/~~m1")).unwrap_err();
        assert_eq!(err.kind(), crate::remote::ErrorKind::InvalidPath);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_subtree_and_ancestors() {
        let tree = tree();
        tree.get_or_create(&path("/shop/orders")).unwrap();
        tree.get_or_create(&path("/shop/payments")).unwrap();
        tree.get_or_create(&path("/other")).unwrap();

        let subtree: Vec<String> = tree
            .subtree(&path("/shop"))
            .iter()
            .map(|f| f.path().to_string())
            .collect();
        assert_eq!(subtree.len(), 3);
        assert_eq!(subtree[0], "/shop");
        assert!(!subtree.contains(&"/other".to_string()));

        let ancestors: Vec<String> = tree
            .ancestors(&path("/shop/orders"))
            .iter()
            .map(|f| f.path().to_string())
            .collect();
        assert_eq!(ancestors, vec!["/shop/orders", "/shop", "/"]);

        assert!(tree.subtree(&path("/missing")).is_empty());
    }
}
