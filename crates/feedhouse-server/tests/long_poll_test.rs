//! Long-poll behaviour of a single node

use std::sync::Arc;
use std::time::Duration;

use feedhouse_core::{FeedPath, Message, Timestamp};
use feedhouse_server::{FeedService, LocalFeedService, MessageFilter, NodeConfig, SearchRequest};

fn node(config: NodeConfig) -> Arc<LocalFeedService> {
    Arc::new(LocalFeedService::new(config).unwrap())
}

fn path(s: &str) -> FeedPath {
    s.parse().unwrap()
}

fn waiting(feed: &str, wait: Duration) -> SearchRequest {
    SearchRequest::new(path(feed))
        .with_filter(MessageFilter::messages_only())
        .wait(wait)
}

fn pending_on(node: &LocalFeedService, feed: &str) -> usize {
    node.engine()
        .tree()
        .get(&path(feed))
        .map(|f| f.pending_count())
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_poll_resolves_on_post() {
    let node = node(NodeConfig::default());

    let search = node.search(waiting("/orders", Duration::from_secs(5)));
    let poll = tokio::spawn(search);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let ack = node.post(Message::new(path("/orders"), "hello")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .expect("long-poll resolved")
        .unwrap()
        .unwrap();

    assert!(!outcome.timed_out);
    assert_eq!(outcome.messages.len(), 1);
    assert_eq!(outcome.messages[0].path, ack.path);
    assert_eq!(outcome.messages[0].payload.as_ref(), b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_timeout_without_data_times_out() {
    let node = node(NodeConfig::default());

    let started = tokio::time::Instant::now();
    let outcome = node
        .search(waiting("/orders", Duration::from_millis(80)))
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert!(outcome.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(pending_on(&node, "/orders"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_child_post_wakes_ancestor_poll() {
    let node = node(NodeConfig::default());

    let poll = tokio::spawn(node.search(waiting("/shop", Duration::from_secs(5))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pending_on(&node, "/shop"), 1);

    node.post(Message::new(path("/shop/orders/eu"), "deep"))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .expect("ancestor woken")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.messages.len(), 1);
    assert_eq!(outcome.messages[0].feed_path(), path("/shop/orders/eu"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sibling_post_does_not_wake_poll() {
    let node = node(NodeConfig::default());

    let search = node.search(waiting("/shop/orders", Duration::from_millis(200)));
    let poll = tokio::spawn(search);
    tokio::time::sleep(Duration::from_millis(50)).await;

    node.post(Message::new(path("/shop/payments"), "elsewhere"))
        .await
        .unwrap();

    let outcome = poll.await.unwrap().unwrap();
    assert!(outcome.timed_out);
    assert!(outcome.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_point_skips_seen_messages() {
    let node = node(NodeConfig::default());
    let first = node.post(Message::new(path("/orders"), "first")).await.unwrap();

    let request = SearchRequest::new(path("/orders"))
        .after(first.timestamp)
        .with_filter(MessageFilter::messages_only())
        .wait(Duration::from_secs(5));
    let poll = tokio::spawn(node.search(request));

    tokio::time::sleep(Duration::from_millis(50)).await;
    node.post(Message::new(path("/orders"), "second")).await.unwrap();

    let outcome = poll.await.unwrap().unwrap();
    assert_eq!(outcome.messages.len(), 1);
    assert_eq!(outcome.messages[0].payload.as_ref(), b"second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_data_returns_without_waiting() {
    let node = node(NodeConfig::default());
    node.post(Message::new(path("/orders"), "ready")).await.unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(500),
        node.search(waiting("/orders", Duration::from_secs(30))),
    )
    .await
    .expect("no wait for existing data")
    .unwrap();

    assert!(!outcome.timed_out);
    assert_eq!(outcome.messages.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_poll_is_pruned_on_next_write() {
    let node = node(NodeConfig::default());

    let poll = tokio::spawn(node.search(waiting("/orders", Duration::from_secs(30))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pending_on(&node, "/orders"), 1);

    poll.abort();
    let _ = poll.await;

    node.post(Message::new(path("/orders"), "late")).await.unwrap();
    assert_eq!(pending_on(&node, "/orders"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_is_capped_by_node_limit() {
    let config = NodeConfig {
        long_poll_timeout_ms: 50,
        ..NodeConfig::default()
    };
    let node = node(config);

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        node.search(waiting("/orders", Duration::from_secs(60))),
    )
    .await
    .expect("capped wait")
    .unwrap();
    assert!(outcome.timed_out);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_earlier_deadline_replaces_timer() {
    let node = node(NodeConfig::default());

    let long = tokio::spawn(node.search(waiting("/orders", Duration::from_secs(10))));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = tokio::time::Instant::now();
    let short = node
        .search(waiting("/orders", Duration::from_millis(60)))
        .await
        .unwrap();
    assert!(short.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The longer poll is still waiting
    assert_eq!(pending_on(&node, "/orders"), 1);
    node.post(Message::new(path("/orders"), "x")).await.unwrap();
    let outcome = long.await.unwrap().unwrap();
    assert_eq!(outcome.messages.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_resolves_waiting_polls() {
    let node = node(NodeConfig::default());

    let poll = tokio::spawn(node.search(waiting("/orders", Duration::from_secs(30))));
    tokio::time::sleep(Duration::from_millis(50)).await;

    node.shutdown();

    let outcome = tokio::time::timeout(Duration::from_secs(1), poll)
        .await
        .expect("resolved by shutdown")
        .unwrap()
        .unwrap();
    assert!(outcome.timed_out);
    assert!(node
        .search(SearchRequest::new(path("/orders")).after(Timestamp::EPOCH))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reading_unknown_feeds_creates_nothing() {
    let node = node(NodeConfig::default());

    let outcome = node
        .search(SearchRequest::new(path("/nowhere/deep")))
        .await
        .unwrap();
    assert!(outcome.is_empty());
    assert!(!outcome.timed_out);
    assert!(node.sync(&path("/elsewhere")).await.unwrap().is_empty());
    assert!(node.engine().tree().is_empty());

    // A waiting search parks on its own feed only
    let outcome = node
        .search(waiting("/nowhere", Duration::from_millis(30)))
        .await
        .unwrap();
    assert!(outcome.timed_out);
    assert!(node.engine().tree().get(&path("/nowhere")).is_some());
    assert!(node.engine().tree().get(&path("/nowhere/deep")).is_none());
}
