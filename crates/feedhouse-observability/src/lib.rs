//! FeedHouse Observability
//!
//! Provides the Prometheus metrics registry shared by every FeedHouse crate.
//!
//! # Features
//!
//! - Global metrics registry with idempotent registration
//! - Text exposition rendering for diagnostics and scraping by an outer layer
//!
//! # Usage
//!
//! ```no_run
//! use feedhouse_observability::{exporter, metrics};
//!
//! metrics::init();
//! metrics::MESSAGES_POSTED_TOTAL.inc();
//!
//! let text = exporter::gather_text().unwrap();
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::gather_text;
pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init();
    }

    #[test]
    fn test_double_init_is_safe() {
        init();
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
