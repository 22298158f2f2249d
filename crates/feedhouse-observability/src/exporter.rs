use prometheus::{Encoder, TextEncoder};

use crate::metrics::{self, REGISTRY};

/// Render every registered metric in the Prometheus text exposition format
pub fn gather_text() -> Result<String, prometheus::Error> {
    metrics::init();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MESSAGES_POSTED_TOTAL;

    #[test]
    fn test_gather_text_contains_registered_metrics() {
        MESSAGES_POSTED_TOTAL.inc();

        let text = gather_text().unwrap();
        assert!(text.contains("feedhouse_messages_posted_total"));
        assert!(text.contains("# TYPE feedhouse_messages_posted_total counter"));
    }
}
