use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// Atomic counters for one or more build watchers.
pub struct BuildMetrics {
    pub builds_started: AtomicU64,
    pub builds_succeeded: AtomicU64,
    pub builds_failed: AtomicU64,
    pub events_coalesced: AtomicU64,
    pub echoes_suppressed: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for BuildMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildMetrics")
            .field("builds_started", &self.builds_started)
            .field("builds_succeeded", &self.builds_succeeded)
            .field("builds_failed", &self.builds_failed)
            .field("events_coalesced", &self.events_coalesced)
            .field("echoes_suppressed", &self.echoes_suppressed)
            .finish()
    }
}

impl Default for BuildMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self {
            builds_started: AtomicU64::new(0),
            builds_succeeded: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            events_coalesced: AtomicU64::new(0),
            echoes_suppressed: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_build_started(&self) {
        self.bump(&self.builds_started, "weft.build.started");
    }

    pub fn record_build_succeeded(&self, millis: u64) {
        self.bump(&self.builds_succeeded, "weft.build.succeeded");
        if let Some(backend) = &self.backend {
            backend.record_histogram("weft.build.duration_ms", millis as f64);
        }
    }

    pub fn record_build_failed(&self) {
        self.bump(&self.builds_failed, "weft.build.failed");
    }

    pub fn record_event_coalesced(&self) {
        self.bump(&self.events_coalesced, "weft.watch.events_coalesced");
    }

    pub fn record_echo_suppressed(&self) {
        self.bump(&self.echoes_suppressed, "weft.watch.echoes_suppressed");
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_succeeded: self.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            events_coalesced: self.events_coalesced.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of build metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub events_coalesced: u64,
    pub echoes_suppressed: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::debug!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::debug!(metric = name, value = value, kind = "histogram", "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(String, u64)>>);

    impl MetricsBackend for Recording {
        fn record_counter(&self, name: &str, value: u64) {
            self.0.lock().unwrap().push((name.to_string(), value));
        }

        fn record_histogram(&self, _name: &str, _value: f64) {}
    }

    #[test]
    fn default_metrics_start_at_zero() {
        assert_eq!(BuildMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn counters_increment_and_forward_to_backend() {
        let backend = Arc::new(Recording::default());
        let metrics = BuildMetrics::with_backend(backend.clone());
        metrics.record_build_started();
        metrics.record_build_started();
        metrics.record_build_succeeded(12);
        metrics.record_build_failed();
        metrics.record_event_coalesced();
        metrics.record_echo_suppressed();

        let snap = metrics.snapshot();
        assert_eq!(snap.builds_started, 2);
        assert_eq!(snap.builds_succeeded, 1);
        assert_eq!(snap.builds_failed, 1);
        assert_eq!(snap.events_coalesced, 1);
        assert_eq!(snap.echoes_suppressed, 1);

        let recorded = backend.0.lock().unwrap();
        assert_eq!(recorded[1], ("weft.build.started".to_string(), 2));
    }

    #[test]
    fn with_logging_backend() {
        let metrics = BuildMetrics::with_backend(Arc::new(LoggingMetricsBackend));
        metrics.record_build_failed();
        assert_eq!(metrics.snapshot().builds_failed, 1);
    }

    #[test]
    fn concurrent_increments() {
        let metrics = Arc::new(BuildMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_event_coalesced();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().events_coalesced, 800);
    }
}
