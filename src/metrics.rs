//! Pipeline metrics collector

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Incremental mean; no sample history is kept
#[derive(Debug, Default, Clone, Copy)]
struct RunningAverage {
    count: u64,
    mean: f64,
}

impl RunningAverage {
    fn push(&mut self, sample: f64) {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
    }
}

#[derive(Debug, Default)]
struct Timings {
    processing: RunningAverage,
    query: RunningAverage,
    operations: BTreeMap<String, u64>,
}

/// Counters owned by one coordinator instance
#[derive(Debug, Default)]
pub struct MetricsCollector {
    events_processed: AtomicU64,
    governance_events_processed: AtomicU64,
    high_risk_events: AtomicU64,
    integration_errors: AtomicU64,
    persistence_errors: AtomicU64,
    events_rejected: AtomicU64,
    queries_executed: AtomicU64,
    cache_hits: AtomicU64,
    timings: Mutex<Timings>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully processed event
    pub fn record_event(&self, operation: &str, elapsed: Duration, governed: bool, high_risk: bool) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        if governed {
            self.governance_events_processed.fetch_add(1, Ordering::Relaxed);
        }
        if high_risk {
            self.high_risk_events.fetch_add(1, Ordering::Relaxed);
        }
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings.processing.push(elapsed.as_secs_f64() * 1000.0);
        *timings.operations.entry(operation.to_string()).or_insert(0) += 1;
    }

    /// Record an event that failed somewhere in the pipeline
    pub fn record_integration_error(&self) {
        self.integration_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed append (also counted as an integration error by the caller)
    pub fn record_persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event refused because the coordinator was not running
    pub fn record_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one query against the query engine
    pub fn record_query(&self, elapsed: Duration, cache_hit: bool) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings.query.push(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        let queries_executed = self.queries_executed.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            governance_events_processed: self.governance_events_processed.load(Ordering::Relaxed),
            high_risk_events: self.high_risk_events.load(Ordering::Relaxed),
            integration_errors: self.integration_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            avg_processing_time_ms: timings.processing.mean,
            queries_executed,
            avg_query_time_ms: timings.query.mean,
            cache_hit_ratio: if queries_executed == 0 {
                0.0
            } else {
                cache_hits as f64 / queries_executed as f64
            },
            operations: timings.operations.clone(),
        }
    }
}

/// Serializable copy of the collector's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub governance_events_processed: u64,
    pub high_risk_events: u64,
    pub integration_errors: u64,
    pub persistence_errors: u64,
    pub events_rejected: u64,
    pub avg_processing_time_ms: f64,
    pub queries_executed: u64,
    pub avg_query_time_ms: f64,
    pub cache_hit_ratio: f64,
    /// Processed events per operation name
    pub operations: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// `integrationErrors / eventsProcessed`; infinite when only errors were seen
    pub fn error_rate(&self) -> f64 {
        match (self.integration_errors, self.events_processed) {
            (0, _) => 0.0,
            (_, 0) => f64::INFINITY,
            (errors, processed) => errors as f64 / processed as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default() {
        let s = MetricsCollector::new().snapshot();
        assert_eq!(s.events_processed, 0);
        assert_eq!(s.integration_errors, 0);
        assert_eq!(s.avg_processing_time_ms, 0.0);
        assert_eq!(s.cache_hit_ratio, 0.0);
        assert_eq!(s.error_rate(), 0.0);
    }

    #[test]
    fn test_running_average() {
        let m = MetricsCollector::new();
        m.record_event("a", Duration::from_millis(10), true, false);
        m.record_event("a", Duration::from_millis(20), true, false);
        m.record_event("b", Duration::from_millis(30), false, true);

        let s = m.snapshot();
        assert_eq!(s.events_processed, 3);
        assert_eq!(s.governance_events_processed, 2);
        assert_eq!(s.high_risk_events, 1);
        assert!((s.avg_processing_time_ms - 20.0).abs() < 1e-6);
        assert_eq!(s.operations["a"], 2);
        assert_eq!(s.operations["b"], 1);
    }

    #[test]
    fn test_query_metrics() {
        let m = MetricsCollector::new();
        m.record_query(Duration::from_millis(4), false);
        m.record_query(Duration::from_millis(2), true);
        m.record_query(Duration::from_millis(6), true);

        let s = m.snapshot();
        assert_eq!(s.queries_executed, 3);
        assert!((s.avg_query_time_ms - 4.0).abs() < 1e-6);
        assert!((s.cache_hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate() {
        let m = MetricsCollector::new();
        m.record_integration_error();
        assert!(m.snapshot().error_rate().is_infinite());

        for _ in 0..10 {
            m.record_event("x", Duration::ZERO, false, false);
        }
        assert!((m.snapshot().error_rate() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serialization() {
        let m = MetricsCollector::new();
        m.record_event("data.read", Duration::from_millis(1), true, false);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"eventsProcessed\":1"));
        assert!(json.contains("\"governanceEventsProcessed\":1"));
        assert!(json.contains("\"operations\":{\"data.read\":1}"));
    }
}
