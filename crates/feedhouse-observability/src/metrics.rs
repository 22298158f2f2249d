use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Feed Metrics
    // ============================================================================

    /// Messages accepted through post
    pub static ref MESSAGES_POSTED_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_messages_posted_total",
        "Total messages posted"
    ).expect("metric can be created");

    /// Messages stored through replicate
    pub static ref MESSAGES_REPLICATED_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_messages_replicated_total",
        "Total messages stored from other nodes"
    ).expect("metric can be created");

    /// ACK twins written next to stored messages
    pub static ref ACKS_STORED_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_acks_stored_total",
        "Total ACK messages stored"
    ).expect("metric can be created");

    /// Payload bytes accepted through post
    pub static ref MESSAGE_BYTES_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_message_bytes_total",
        "Total payload bytes posted"
    ).expect("metric can be created");

    /// Search latency, relay included
    pub static ref SEARCH_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("feedhouse_search_latency_seconds", "Search latency in seconds")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    ).expect("metric can be created");

    /// Relay fetches by outcome
    pub static ref RELAY_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_relay_requests_total", "Total relay fetches to peers"),
        &["outcome"] // ok, error
    ).expect("metric can be created");

    // ============================================================================
    // Long-poll Metrics
    // ============================================================================

    /// Long-polls currently waiting
    pub static ref LONG_POLLS_PENDING: IntGauge = IntGauge::new(
        "feedhouse_long_polls_pending",
        "Number of registered long-polls"
    ).expect("metric can be created");

    /// Long-poll resolutions by outcome
    pub static ref LONG_POLL_RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_long_poll_resolutions_total", "Total long-poll resolutions"),
        &["outcome"] // triggered, timed_out, cancelled
    ).expect("metric can be created");

    // ============================================================================
    // Buffer Metrics
    // ============================================================================

    /// Bytes committed to buckets across all buffers
    pub static ref POOL_SIZE_BYTES: IntGauge = IntGauge::new(
        "feedhouse_pool_size_bytes",
        "Bytes committed to message buckets"
    ).expect("metric can be created");

    /// Buckets handed out by the pool
    pub static ref BUCKETS_ALLOCATED_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_buckets_allocated_total",
        "Total buckets allocated"
    ).expect("metric can be created");

    /// Buckets dropped by reclamation
    pub static ref BUCKETS_EVICTED_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_buckets_evicted_total",
        "Total buckets evicted"
    ).expect("metric can be created");

    /// Writes that did not fit the current bucket
    pub static ref BUCKET_OVERFLOWS_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_bucket_overflows_total",
        "Total bucket overflows recovered"
    ).expect("metric can be created");

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    /// Replication links currently running
    pub static ref REPLICATION_LINKS_ACTIVE: IntGauge = IntGauge::new(
        "feedhouse_replication_links_active",
        "Number of running replication links"
    ).expect("metric can be created");

    /// Replication links stopped by an error
    pub static ref REPLICATION_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_replication_errors_total",
        "Total replication link failures"
    ).expect("metric can be created");

    /// Registered services
    pub static ref HOSTS_REGISTERED: IntGauge = IntGauge::new(
        "feedhouse_hosts_registered",
        "Number of services registered with the cluster"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Feed metrics
        REGISTRY
            .register(Box::new(MESSAGES_POSTED_TOTAL.clone()))
            .expect("messages_posted_total can be registered");
        REGISTRY
            .register(Box::new(MESSAGES_REPLICATED_TOTAL.clone()))
            .expect("messages_replicated_total can be registered");
        REGISTRY
            .register(Box::new(ACKS_STORED_TOTAL.clone()))
            .expect("acks_stored_total can be registered");
        REGISTRY
            .register(Box::new(MESSAGE_BYTES_TOTAL.clone()))
            .expect("message_bytes_total can be registered");
        REGISTRY
            .register(Box::new(SEARCH_LATENCY.clone()))
            .expect("search_latency can be registered");
        REGISTRY
            .register(Box::new(RELAY_REQUESTS_TOTAL.clone()))
            .expect("relay_requests_total can be registered");

        // Long-poll metrics
        REGISTRY
            .register(Box::new(LONG_POLLS_PENDING.clone()))
            .expect("long_polls_pending can be registered");
        REGISTRY
            .register(Box::new(LONG_POLL_RESOLUTIONS_TOTAL.clone()))
            .expect("long_poll_resolutions_total can be registered");

        // Buffer metrics
        REGISTRY
            .register(Box::new(POOL_SIZE_BYTES.clone()))
            .expect("pool_size_bytes can be registered");
        REGISTRY
            .register(Box::new(BUCKETS_ALLOCATED_TOTAL.clone()))
            .expect("buckets_allocated_total can be registered");
        REGISTRY
            .register(Box::new(BUCKETS_EVICTED_TOTAL.clone()))
            .expect("buckets_evicted_total can be registered");
        REGISTRY
            .register(Box::new(BUCKET_OVERFLOWS_TOTAL.clone()))
            .expect("bucket_overflows_total can be registered");

        // Cluster metrics
        REGISTRY
            .register(Box::new(REPLICATION_LINKS_ACTIVE.clone()))
            .expect("replication_links_active can be registered");
        REGISTRY
            .register(Box::new(REPLICATION_ERRORS_TOTAL.clone()))
            .expect("replication_errors_total can be registered");
        REGISTRY
            .register(Box::new(HOSTS_REGISTERED.clone()))
            .expect("hosts_registered can be registered");
    });
}
