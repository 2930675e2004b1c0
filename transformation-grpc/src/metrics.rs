//! Prometheus request metrics.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Label used for names the registry does not know, keeping label
/// cardinality bounded by what is registered.
pub const UNREGISTERED: &str = "unregistered";

pub struct Metrics {
    pub requests: IntCounterVec,
    pub request_duration: HistogramVec,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "transformation_requests_total",
                "TransformFeatures calls by transformation and outcome",
            ),
            &["transformation", "outcome"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "transformation_request_duration_seconds",
                "TransformFeatures latency, decode to encode",
            ),
            &["transformation"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            requests,
            request_duration,
            registry,
        })
    }

    pub fn observe(&self, transformation: &str, outcome: &str, elapsed: Duration) {
        self.requests
            .with_label_values(&[transformation, outcome])
            .inc();
        self.request_duration
            .with_label_values(&[transformation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn request_count(&self, transformation: &str, outcome: &str) -> u64 {
        self.requests
            .with_label_values(&[transformation, outcome])
            .get()
    }

    /// Text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("conv_rate_transform", "ok", Duration::from_millis(3));
        metrics.observe("conv_rate_transform", "ok", Duration::from_millis(5));
        metrics.observe(UNREGISTERED, "invalid_argument", Duration::from_micros(40));

        assert_eq!(metrics.request_count("conv_rate_transform", "ok"), 2);
        assert_eq!(metrics.request_count(UNREGISTERED, "invalid_argument"), 1);

        let text = metrics.export().unwrap();
        assert!(text.contains("transformation_requests_total"));
        assert!(text.contains("transformation_request_duration_seconds"));
    }
}
