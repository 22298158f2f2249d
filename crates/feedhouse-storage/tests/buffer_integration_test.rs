//! Integration tests for message buffers sharing one buffer pool

use std::sync::Arc;

use feedhouse_core::{FeedPath, Message, MessageClock, Timestamp};
use feedhouse_storage::{codec, BufferConfig, BufferPool, MessageBuffer};
use rand::Rng;

fn message(feed: &str, i: usize, payload: &str) -> Message {
    let path: FeedPath = format!("/{feed}/~~m{i}").parse().unwrap();
    Message::new(path, payload.to_string())
}

/// Encoded length of `message(feed, i, payload)` once stamped
fn frame_len(feed: &str, payload: &str) -> usize {
    let mut sample = message(feed, 0, payload);
    sample.timestamp = Timestamp::from_nanos(1_000_000_000_000_000_000);
    codec::encode(&sample).unwrap().len()
}

#[tokio::test]
async fn test_reclaim_evicts_oldest_registered_first() {
    let payload = "x".repeat(300);
    let frame = frame_len("a", &payload);

    // Every frame is over half a bucket, so each new bucket is sized for two frames
    let pool = Arc::new(BufferPool::new(BufferConfig {
        bucket_size: frame + 10,
        max_pool_size: 6 * 2 * frame,
        ..Default::default()
    }));
    let clock = Arc::new(MessageClock::new());
    let a = MessageBuffer::new(pool.clone(), clock.clone());
    let b = MessageBuffer::new(pool.clone(), clock.clone());

    let mut a_stamps = Vec::new();
    for i in 0..10 {
        a_stamps.push(a.add_message(message("a", i, &payload)).await.unwrap().timestamp);
    }
    for i in 0..10 {
        b.add_message(message("b", i, &payload)).await.unwrap();
    }
    assert_eq!(pool.stats().bucket_count, 10);

    let evicted = pool.deallocate_buckets().await;

    assert_eq!(evicted, 4);
    assert!(pool.current_size() <= pool.max_size());

    let a_stats = a.stats().await;
    assert_eq!(a_stats.bucket_count, 1);
    assert_eq!(a_stats.message_count, 2);
    assert_eq!(a_stats.horizon, a_stamps[7].next());

    let b_stats = b.stats().await;
    assert_eq!(b_stats.bucket_count, 5);
    assert_eq!(b_stats.horizon, Timestamp::EPOCH);
}

#[tokio::test]
async fn test_reclaim_is_noop_under_budget() {
    let pool = Arc::new(BufferPool::new(BufferConfig::default()));
    let buffer = MessageBuffer::new(pool.clone(), Arc::new(MessageClock::new()));
    buffer.add_message(message("a", 1, "small")).await.unwrap();

    assert_eq!(pool.deallocate_buckets().await, 0);
    assert_eq!(buffer.stats().await.message_count, 1);
}

#[tokio::test]
async fn test_mixed_sizes_are_loss_free() {
    let pool = Arc::new(BufferPool::new(BufferConfig {
        bucket_size: 512,
        max_pool_size: 64 * 1024 * 1024,
        ..Default::default()
    }));
    let buffer = MessageBuffer::new(pool, Arc::new(MessageClock::new()));

    let mut rng = rand::thread_rng();
    let mut expected = Vec::new();
    for i in 0..200 {
        let len = rng.gen_range(0..3_000);
        let payload: String = (0..len).map(|j| (b'a' + (j % 26) as u8) as char).collect();
        let stored = buffer.add_message(message("mixed", i, &payload)).await.unwrap();
        expected.push((stored.path.clone(), stored.payload.clone()));
    }

    let actual: Vec<_> = buffer
        .messages_after(Timestamp::EPOCH)
        .await
        .map(|m| (m.path, m.payload))
        .collect();
    assert_eq!(actual, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_timestamp_order() {
    let pool = Arc::new(BufferPool::new(BufferConfig {
        bucket_size: 1024,
        ..Default::default()
    }));
    let buffer = MessageBuffer::new(pool, Arc::new(MessageClock::new()));

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    buffer
                        .add_message(message(&format!("w{w}"), i, "payload"))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                let stamps: Vec<Timestamp> = buffer
                    .messages_after(Timestamp::EPOCH)
                    .await
                    .map(|m| m.timestamp)
                    .collect();
                assert!(stamps.windows(2).all(|w| w[0] < w[1]));
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();

    let all: Vec<_> = buffer.messages_after(Timestamp::EPOCH).await.collect();
    assert_eq!(all.len(), 400);
    assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}
