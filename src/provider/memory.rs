//! In-memory collaborators for single-process use and testing
//!
//! `MemoryQueryEngine` keeps indexed records in a bounded `Vec` with a small
//! result cache; `MemoryWebhookTransport` records deliveries instead of
//! sending them. Both lose their state on drop.

use super::{
    EventFilter, QueryEngine, QueryResult, StreamSpec, WebhookConfig, WebhookStats,
    WebhookTransport,
};
use crate::error::{AuditError, Result};
use crate::types::{AuditEvent, ProcessedEvent, SequencedRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Configuration for the in-memory query engine
#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// Maximum indexed records; oldest are dropped first (0 = unbounded)
    pub max_records: usize,
    /// Maximum cached query results (0 disables the cache)
    pub cache_capacity: usize,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            max_records: 100_000,
            cache_capacity: 256,
        }
    }
}

/// In-memory query engine
pub struct MemoryQueryEngine {
    config: MemoryEngineConfig,
    records: RwLock<Vec<SequencedRecord>>,
    streams: RwLock<HashMap<String, StreamSpec>>,
    /// Serialized filter → result; cleared on every index
    cache: RwLock<HashMap<String, QueryResult>>,
    /// Bumped under the records write lock on every index
    generation: AtomicU64,
}

impl MemoryQueryEngine {
    pub fn new(config: MemoryEngineConfig) -> Self {
        Self {
            config,
            records: RwLock::new(Vec::new()),
            streams: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of indexed records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Run a query against the current records, with the generation it saw
    async fn snapshot_query(&self, filter: &EventFilter) -> (u64, QueryResult) {
        let records = self.records.read().await;
        let generation = self.generation.load(Ordering::SeqCst);
        (generation, Self::run_query(&records, filter))
    }

    /// Cache a result unless records were indexed after it was computed
    async fn cache_result(&self, key: String, generation: u64, result: &QueryResult) {
        let mut cache = self.cache.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if cache.len() >= self.config.cache_capacity {
            cache.clear();
        }
        cache.insert(key, result.clone());
    }

    fn run_query(records: &[SequencedRecord], filter: &EventFilter) -> QueryResult {
        let matched: Vec<&AuditEvent> = records
            .iter()
            .map(|r| &r.event)
            .filter(|e| filter.matches(e))
            .collect();
        let total = matched.len();
        let events = match filter.limit {
            Some(limit) => matched.into_iter().take(limit).cloned().collect(),
            None => matched.into_iter().cloned().collect(),
        };
        QueryResult {
            events,
            total,
            cache_hit: false,
        }
    }
}

impl Default for MemoryQueryEngine {
    fn default() -> Self {
        Self::new(MemoryEngineConfig::default())
    }
}

#[async_trait]
impl QueryEngine for MemoryQueryEngine {
    async fn index(&self, record: &SequencedRecord) -> Result<()> {
        {
            let mut records = self.records.write().await;
            records.push(record.clone());
            if self.config.max_records > 0 && records.len() > self.config.max_records {
                let drain_count = records.len() - self.config.max_records;
                records.drain(..drain_count);
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.cache.write().await.clear();
        Ok(())
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<QueryResult> {
        let key = serde_json::to_string(filter)?;
        if self.config.cache_capacity > 0 {
            if let Some(hit) = self.cache.read().await.get(&key) {
                let mut result = hit.clone();
                result.cache_hit = true;
                return Ok(result);
            }
        }

        let (generation, result) = self.snapshot_query(filter).await;
        if self.config.cache_capacity > 0 {
            self.cache_result(key, generation, &result).await;
        }
        Ok(result)
    }

    async fn create_stream(&self, name: &str, filter: EventFilter) -> Result<StreamSpec> {
        if name.trim().is_empty() {
            return Err(AuditError::Query("Stream name must not be empty".to_string()));
        }
        let spec = StreamSpec {
            stream_id: format!("stream-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            filter,
        };
        self.streams
            .write()
            .await
            .insert(spec.stream_id.clone(), spec.clone());
        tracing::info!(stream_id = %spec.stream_id, name = %spec.name, "Stream created");
        Ok(spec)
    }

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamSpec>> {
        Ok(self.streams.read().await.get(stream_id).cloned())
    }

    async fn replay_session(
        &self,
        session_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<AuditEvent>> {
        let filter = EventFilter {
            session_id: Some(session_id.to_string()),
            since,
            ..Default::default()
        };
        let records = self.records.read().await;
        let mut matched: Vec<&SequencedRecord> =
            records.iter().filter(|r| filter.matches(&r.event)).collect();
        matched.sort_by_key(|r| r.sequence_number);
        Ok(matched.into_iter().map(|r| r.event.clone()).collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// A webhook registered with the in-memory transport
#[derive(Debug, Clone)]
pub struct RegisteredWebhook {
    pub uri: String,
    pub config: WebhookConfig,
}

/// In-memory webhook transport
///
/// Records each delivery as `(webhook URI, event)`. `set_failing(true)`
/// makes every delivery fail, for exercising health checks.
#[derive(Default)]
pub struct MemoryWebhookTransport {
    webhooks: RwLock<Vec<RegisteredWebhook>>,
    deliveries: RwLock<Vec<(String, ProcessedEvent)>>,
    registered: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
    failing: AtomicBool,
}

impl MemoryWebhookTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Deliveries so far, oldest first
    pub async fn deliveries(&self) -> Vec<(String, ProcessedEvent)> {
        self.deliveries.read().await.clone()
    }

    pub async fn webhooks(&self) -> Vec<RegisteredWebhook> {
        self.webhooks.read().await.clone()
    }
}

#[async_trait]
impl WebhookTransport for MemoryWebhookTransport {
    async fn register(&self, config: WebhookConfig) -> Result<String> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(AuditError::Webhook(format!(
                "Webhook URL must be http(s): {}",
                config.url
            )));
        }
        let uri = format!("webhook://{}", uuid::Uuid::new_v4().simple());
        self.webhooks.write().await.push(RegisteredWebhook {
            uri: uri.clone(),
            config,
        });
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(uri)
    }

    async fn deliver(&self, event: &ProcessedEvent) -> Result<()> {
        let targets: Vec<String> = self
            .webhooks
            .read()
            .await
            .iter()
            .filter(|w| w.config.filters.matches(&event.event))
            .map(|w| w.uri.clone())
            .collect();

        for uri in targets {
            if self.failing.load(Ordering::SeqCst) {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return Err(AuditError::Webhook(format!("Delivery to {} failed", uri)));
            }
            self.deliveries.write().await.push((uri, event.clone()));
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stats(&self) -> WebhookStats {
        WebhookStats {
            registered: self.registered.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventStatus;

    fn record(seq: u64, op: &str, trace: &str, span: &str) -> SequencedRecord {
        SequencedRecord {
            sequence_number: seq,
            checksum: format!("sha256:{}", seq),
            event: AuditEvent::new(op, EventStatus::Ok)
                .with_trace(trace, span)
                .with_attribute("session.id", "sess-1"),
        }
    }

    #[tokio::test]
    async fn test_index_and_query() {
        let engine = MemoryQueryEngine::default();
        engine.index(&record(0, "a.read", "t1", "s1")).await.unwrap();
        engine.index(&record(1, "a.write", "t1", "s2")).await.unwrap();
        engine.index(&record(2, "b.read", "t2", "s3")).await.unwrap();

        let result = engine
            .query_events(&EventFilter::for_span("t1", "s2"))
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.events[0].operation, "a.write");

        let result = engine
            .query_events(&EventFilter {
                operation: Some("a.*".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.events.len(), 1);
    }

    #[tokio::test]
    async fn test_result_computed_before_index_is_not_cached() {
        let engine = MemoryQueryEngine::default();
        let filter = EventFilter::for_span("t1", "s1");
        let key = serde_json::to_string(&filter).unwrap();

        // A query snapshots the records, then an index lands before it caches
        let (generation, stale) = engine.snapshot_query(&filter).await;
        engine.index(&record(0, "a.read", "t1", "s1")).await.unwrap();
        engine.cache_result(key, generation, &stale).await;
        assert_eq!(stale.total, 0);

        let result = engine.query_events(&filter).await.unwrap();
        assert!(!result.cache_hit);
        assert_eq!(result.total, 1);

        let again = engine.query_events(&filter).await.unwrap();
        assert!(again.cache_hit);
        assert_eq!(again.total, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_and_invalidation() {
        let engine = MemoryQueryEngine::default();
        engine.index(&record(0, "a", "t1", "s1")).await.unwrap();

        let filter = EventFilter::for_span("t1", "s1");
        assert!(!engine.query_events(&filter).await.unwrap().cache_hit);
        assert!(engine.query_events(&filter).await.unwrap().cache_hit);

        engine.index(&record(1, "b", "t1", "s1")).await.unwrap();
        let result = engine.query_events(&filter).await.unwrap();
        assert!(!result.cache_hit);
        assert_eq!(result.total, 2);
    }

    #[tokio::test]
    async fn test_max_records_bound() {
        let engine = MemoryQueryEngine::new(MemoryEngineConfig {
            max_records: 2,
            cache_capacity: 0,
        });
        for i in 0..5 {
            engine.index(&record(i, "a", "t", "s")).await.unwrap();
        }
        assert_eq!(engine.len().await, 2);
    }

    #[tokio::test]
    async fn test_streams() {
        let engine = MemoryQueryEngine::default();
        let spec = engine
            .create_stream("errors", EventFilter::default())
            .await
            .unwrap();
        assert!(spec.stream_id.starts_with("stream-"));
        assert_eq!(engine.stream(&spec.stream_id).await.unwrap(), Some(spec));
        assert!(engine.stream("nope").await.unwrap().is_none());
        assert!(engine.create_stream(" ", EventFilter::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_replay_session_in_sequence_order() {
        let engine = MemoryQueryEngine::default();
        engine.index(&record(2, "third", "t", "s")).await.unwrap();
        engine.index(&record(0, "first", "t", "s")).await.unwrap();
        engine.index(&record(1, "second", "t", "s")).await.unwrap();
        let mut other = record(3, "other", "t", "s");
        other.event.attributes.insert("session.id".to_string(), "sess-2".into());
        engine.index(&other).await.unwrap();

        let events = engine.replay_session("sess-1", None).await.unwrap();
        let ops: Vec<_> = events.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(ops, vec!["first", "second", "third"]);

        let future = chrono::Utc::now() + chrono::Duration::days(1);
        assert!(engine.replay_session("sess-1", Some(future)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_register_and_deliver() {
        let transport = MemoryWebhookTransport::new();
        let uri = transport
            .register(WebhookConfig {
                url: "https://example.com/hook".to_string(),
                filters: EventFilter {
                    operation: Some("data.*".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert!(uri.starts_with("webhook://"));

        let hit = ProcessedEvent {
            event: AuditEvent::new("data.read", EventStatus::Ok),
            receipt: None,
        };
        let miss = ProcessedEvent {
            event: AuditEvent::new("user.login", EventStatus::Ok),
            receipt: None,
        };
        transport.deliver(&hit).await.unwrap();
        transport.deliver(&miss).await.unwrap();

        let deliveries = transport.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, uri);
        assert_eq!(transport.stats().delivered, 1);
        assert_eq!(transport.stats().registered, 1);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_url_and_counts_failures() {
        let transport = MemoryWebhookTransport::new();
        assert!(transport
            .register(WebhookConfig {
                url: "ftp://nope".to_string(),
                filters: EventFilter::default(),
            })
            .await
            .is_err());

        transport
            .register(WebhookConfig {
                url: "http://localhost/hook".to_string(),
                filters: EventFilter::default(),
            })
            .await
            .unwrap();
        transport.set_failing(true);
        let event = ProcessedEvent {
            event: AuditEvent::new("x", EventStatus::Ok),
            receipt: None,
        };
        assert!(transport.deliver(&event).await.is_err());
        assert_eq!(transport.stats().failed, 1);
        assert!((transport.stats().failure_rate() - 1.0).abs() < f64::EPSILON);
    }
}
