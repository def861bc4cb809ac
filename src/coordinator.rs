//! Audit coordinator: the ingestion pipeline and its entry points
//!
//! `AuditCoordinator` owns one instance of every pipeline component and runs
//! each event through them in a fixed order:
//!
//! 1. validate (repairing a missing/invalid timestamp)
//! 2. classify (governance annotation)
//! 3. correlate (trace context + correlation table)
//! 4. persist (checksummed, sequenced append)
//! 5. index in the query engine
//! 6. attach the `auditURI` to the in-memory copy
//! 7. notify subscribers, then hand off to webhooks without waiting
//!
//! A failure in any step aborts only that event: it is counted, logged, and
//! published as an `integration-error` notification. Query, stream, replay
//! and webhook entry points forward to the pluggable collaborators.

use crate::config::AuditConfig;
use crate::correlation::{spawn_cleanup_task, ExportedSpan, SpanContext, SpanCorrelator};
use crate::error::{AuditError, Result};
use crate::governance::GovernanceClassifier;
use crate::health::{
    HealthInputs, HealthMonitor, HealthReport, ProcessResourceProbe, ResourceProbe, ResourceUsage,
};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::notify::{Notification, NotificationHub, NotificationKind, Subscription};
use crate::provider::memory::{MemoryQueryEngine, MemoryWebhookTransport};
use crate::provider::{
    EventFilter, QueryEngine, QueryResult, StreamSpec, WebhookConfig, WebhookTransport,
};
use crate::types::{AuditEvent, ProcessedEvent, RiskLevel, SequencedRecord};
use crate::uri::{self, Resolution};
use crate::writer::ChecksumWriter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Attribute keeping a caller-supplied timestamp that had to be replaced
pub const ORIGINAL_TIMESTAMP_ATTRIBUTE: &str = "timestamp.original";

/// Coordinator lifecycle: created → running → shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

struct CleanupTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Builder for [`AuditCoordinator`]
pub struct AuditCoordinatorBuilder {
    config: AuditConfig,
    query_engine: Option<Arc<dyn QueryEngine>>,
    webhook_transport: Option<Arc<dyn WebhookTransport>>,
    resource_probe: Option<Arc<dyn ResourceProbe>>,
}

impl AuditCoordinatorBuilder {
    /// Query/index backend (default: [`MemoryQueryEngine`])
    pub fn query_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.query_engine = Some(engine);
        self
    }

    /// Webhook backend (default: [`MemoryWebhookTransport`])
    pub fn webhook_transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.webhook_transport = Some(transport);
        self
    }

    /// Resource sampler for the `systemResources` check
    pub fn resource_probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.resource_probe = Some(Arc::new(probe));
        self
    }

    pub fn build(self) -> AuditCoordinator {
        let config = self.config;
        AuditCoordinator {
            classifier: GovernanceClassifier::new(config.governance.clone()),
            health: HealthMonitor::new(config.health.clone()),
            writer: ChecksumWriter::new(config.writer_options()),
            correlator: Arc::new(SpanCorrelator::new()),
            query_engine: self
                .query_engine
                .unwrap_or_else(|| Arc::new(MemoryQueryEngine::default())),
            webhook_transport: self
                .webhook_transport
                .unwrap_or_else(|| Arc::new(MemoryWebhookTransport::new())),
            resource_probe: self
                .resource_probe
                .unwrap_or_else(|| Arc::new(ProcessResourceProbe)),
            metrics: MetricsCollector::new(),
            hub: NotificationHub::new(),
            lifecycle: RwLock::new(Lifecycle::Created),
            initialized: AtomicBool::new(false),
            unpersisted_seq: AtomicU64::new(0),
            cleanup: std::sync::Mutex::new(None),
            config,
        }
    }
}

/// The audit pipeline
pub struct AuditCoordinator {
    config: AuditConfig,
    classifier: GovernanceClassifier,
    correlator: Arc<SpanCorrelator>,
    writer: ChecksumWriter,
    query_engine: Arc<dyn QueryEngine>,
    webhook_transport: Arc<dyn WebhookTransport>,
    resource_probe: Arc<dyn ResourceProbe>,
    metrics: MetricsCollector,
    health: HealthMonitor,
    hub: NotificationHub,

    /// Held shared while an event is in flight; shutdown takes it exclusively
    lifecycle: RwLock<Lifecycle>,
    initialized: AtomicBool,

    /// Index sequence when immutable trails are off
    unpersisted_seq: AtomicU64,
    cleanup: std::sync::Mutex<Option<CleanupTask>>,
}

impl AuditCoordinator {
    pub fn builder(config: AuditConfig) -> AuditCoordinatorBuilder {
        AuditCoordinatorBuilder {
            config,
            query_engine: None,
            webhook_transport: None,
            resource_probe: None,
        }
    }

    /// Coordinator with in-memory collaborators
    pub fn new(config: AuditConfig) -> Self {
        Self::builder(config).build()
    }

    /// Validate config, open the audit log, and start the correlation sweep.
    ///
    /// Failures here are fatal and returned to the caller. Calling it again
    /// while running is a no-op; a shut-down coordinator cannot be restarted.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.lifecycle.write().await;
        match *state {
            Lifecycle::Running => return Ok(()),
            Lifecycle::ShutDown => {
                return Err(AuditError::Initialization(
                    "coordinator has been shut down".to_string(),
                ))
            }
            Lifecycle::Created => {}
        }

        self.config
            .validate()
            .map_err(|e| AuditError::Initialization(e.to_string()))?;

        if self.config.enable_immutable_trails {
            self.writer.open().await?;
        }

        if self.config.enable_opentelemetry {
            let (stop, rx) = watch::channel(false);
            let handle = spawn_cleanup_task(
                self.correlator.clone(),
                self.config.correlation_cleanup_interval(),
                self.config.correlation_max_age(),
                rx,
            );
            *self.cleanup.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(CleanupTask { stop, handle });
        }

        *state = Lifecycle::Running;
        self.initialized.store(true, Ordering::SeqCst);

        tracing::info!(
            audit_dir = %self.config.audit_dir.display(),
            governance = self.config.enable_governance,
            immutable_trails = self.config.enable_immutable_trails,
            opentelemetry = self.config.enable_opentelemetry,
            webhooks = self.config.enable_webhooks,
            query_engine = self.query_engine.name(),
            "Audit coordinator initialized"
        );
        self.hub.publish(Notification::Initialized);
        Ok(())
    }

    /// Stop accepting events, drain in-flight ones, and release resources.
    ///
    /// Always completes; a writer close failure is logged only.
    pub async fn shutdown(&self) {
        // Waits for every in-flight event to release its shared guard
        let mut state = self.lifecycle.write().await;
        if *state != Lifecycle::Running {
            *state = Lifecycle::ShutDown;
            return;
        }
        *state = Lifecycle::ShutDown;
        self.initialized.store(false, Ordering::SeqCst);

        let cleanup = self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = cleanup {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "Correlation cleanup task ended abnormally");
            }
        }

        if self.config.enable_immutable_trails {
            if let Err(e) = self.writer.close().await {
                tracing::error!(error = %e, "Failed to close audit writer during shutdown");
            }
        }

        let metrics = self.metrics.snapshot();
        tracing::info!(
            events_processed = metrics.events_processed,
            integration_errors = metrics.integration_errors,
            "Audit coordinator shut down"
        );
        self.hub.publish(Notification::Shutdown);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Process one raw, JSON-shaped event.
    ///
    /// Per-event failures are counted and published as `integration-error`
    /// notifications; the returned error is informational.
    pub async fn process_event(&self, raw: serde_json::Value) -> Result<ProcessedEvent> {
        self.process_event_with_context(raw, None).await
    }

    /// Process a raw event under an active trace context
    pub async fn process_event_with_context(
        &self,
        raw: serde_json::Value,
        ctx: Option<SpanContext>,
    ) -> Result<ProcessedEvent> {
        let _running = self.enter().await?;
        let event = match parse_raw_event(raw) {
            Ok(event) => event,
            Err(e) => {
                self.record_failure("validation", &e, None);
                return Err(e);
            }
        };
        self.run_pipeline(event, ctx).await
    }

    /// Process an already-typed event
    pub async fn process_audit_event(
        &self,
        event: AuditEvent,
        ctx: Option<SpanContext>,
    ) -> Result<ProcessedEvent> {
        let _running = self.enter().await?;
        if let Err(e) = validate_event(&event) {
            let operation = Some(event.operation.as_str()).filter(|op| !op.trim().is_empty());
            self.record_failure("validation", &e, operation);
            return Err(e);
        }
        self.run_pipeline(event, ctx).await
    }

    /// Process a batch of exported spans concurrently; results keep batch order
    pub async fn export_spans(&self, spans: Vec<ExportedSpan>) -> Vec<Result<ProcessedEvent>> {
        let count = spans.len();
        let results = futures::future::join_all(spans.into_iter().map(|span| {
            let (event, ctx) = span.into_event();
            self.process_audit_event(event, Some(ctx))
        }))
        .await;
        tracing::debug!(
            spans = count,
            failed = results.iter().filter(|r| r.is_err()).count(),
            "Span batch exported"
        );
        results
    }

    /// Query the collaborator index, recording query metrics
    pub async fn query_events(&self, filter: &EventFilter) -> Result<QueryResult> {
        let start = Instant::now();
        let result = self.query_engine.query_events(filter).await?;
        self.metrics.record_query(start.elapsed(), result.cache_hit);
        Ok(result)
    }

    /// Register a named stream; address it with [`uri::create_stream_uri`]
    pub async fn create_stream(&self, name: &str, filter: EventFilter) -> Result<StreamSpec> {
        let spec = self.query_engine.create_stream(name, filter).await?;
        tracing::info!(stream_id = %spec.stream_id, name, "Audit stream created");
        Ok(spec)
    }

    /// Live audit events matching a registered stream's filter
    pub async fn subscribe_stream(&self, stream_id: &str) -> Result<Subscription> {
        let spec = self
            .query_engine
            .stream(stream_id)
            .await?
            .ok_or_else(|| AuditError::Query(format!("Unknown stream: {}", stream_id)))?;
        let filter = spec.filter;
        Ok(self.hub.subscribe_filtered(move |n| {
            matches!(n, Notification::AuditEvent(p) if filter.matches(&p.event))
        }))
    }

    /// Events of one session, oldest first
    pub async fn replay_session(
        &self,
        session_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<AuditEvent>> {
        self.query_engine.replay_session(session_id, since).await
    }

    /// Register a webhook with the transport, returning its URI
    pub async fn register_webhook(&self, config: WebhookConfig) -> Result<String> {
        if !self.config.enable_webhooks {
            return Err(AuditError::Webhook("webhooks are disabled".to_string()));
        }
        let uri = self.webhook_transport.register(config).await?;
        tracing::info!(webhook = %uri, "Webhook registered");
        Ok(uri)
    }

    /// Resolve an `audit://` URI; `None` when malformed or unknown
    pub async fn resolve(&self, uri: &str) -> Option<Resolution> {
        uri::resolve_observed(uri, self.query_engine.as_ref(), |elapsed, cache_hit| {
            self.metrics.record_query(elapsed, cache_hit)
        })
        .await
    }

    /// Latest event seen for a trace/span pair
    pub async fn get_correlated_events(&self, trace_id: &str, span_id: &str) -> Option<AuditEvent> {
        self.correlator.get_correlated_events(trace_id, span_id).await
    }

    /// Subscribe to every notification
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn subscribe_kinds(&self, kinds: &[NotificationKind]) -> Subscription {
        self.hub.subscribe_kinds(kinds)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Composite health verdict over every component
    pub async fn health_check(&self) -> HealthReport {
        let query_engine_reachable = match self.query_engine.health().await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(engine = self.query_engine.name(), error = %e, "Query engine health check failed");
                false
            }
        };
        let inputs = HealthInputs {
            initialized: self.is_initialized(),
            metrics: self.metrics.snapshot(),
            webhooks_enabled: self.config.enable_webhooks,
            webhook_stats: self.webhook_transport.stats(),
            immutable_trails_enabled: self.config.enable_immutable_trails,
            writer: self.writer.stats().await,
            query_engine_reachable,
            resources: self.sample_resources().await,
        };
        self.health.evaluate(&inputs)
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// The audit log writer, for inspecting files and statistics
    pub fn writer(&self) -> &ChecksumWriter {
        &self.writer
    }

    pub fn correlator(&self) -> &SpanCorrelator {
        &self.correlator
    }

    /// Probe samples may touch the filesystem, so they run off the async workers
    async fn sample_resources(&self) -> ResourceUsage {
        let probe = self.resource_probe.clone();
        match tokio::task::spawn_blocking(move || probe.sample()).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(error = %e, "Resource probe failed");
                ResourceUsage::default()
            }
        }
    }

    /// Shared lifecycle guard for one event; rejects when not running
    async fn enter(&self) -> Result<RwLockReadGuard<'_, Lifecycle>> {
        let state = self.lifecycle.read().await;
        if *state != Lifecycle::Running {
            self.metrics.record_rejected();
            tracing::warn!(state = ?*state, "Audit event rejected: coordinator not running");
            return Err(AuditError::ShuttingDown);
        }
        Ok(state)
    }

    async fn run_pipeline(
        &self,
        event: AuditEvent,
        ctx: Option<SpanContext>,
    ) -> Result<ProcessedEvent> {
        let span = tracing::debug_span!("audit.process", operation = %event.operation);
        let operation = event.operation.clone();
        let result = self.pipeline(event, ctx).instrument(span).await;
        if let Err((stage, e)) = &result {
            self.record_failure(stage, e, Some(&operation));
        }
        result.map_err(|(_, e)| e)
    }

    async fn pipeline(
        &self,
        mut event: AuditEvent,
        ctx: Option<SpanContext>,
    ) -> std::result::Result<ProcessedEvent, (&'static str, AuditError)> {
        let start = Instant::now();

        if chrono::DateTime::parse_from_rfc3339(&event.timestamp).is_err() {
            tracing::debug!(timestamp = %event.timestamp, "Repairing missing or invalid timestamp");
            let original = std::mem::replace(&mut event.timestamp, crate::types::now_iso8601());
            if !original.trim().is_empty() {
                event
                    .attributes
                    .insert(ORIGINAL_TIMESTAMP_ATTRIBUTE.to_string(), original.into());
            }
        }

        let annotation = if self.config.enable_governance {
            let annotation = self.classifier.classify(&event);
            event.governance = Some(annotation.clone());
            Some(annotation)
        } else {
            None
        };

        if self.config.enable_opentelemetry {
            let ctx = ctx.or_else(|| SpanContext::from_event_ids(&event));
            event = self.correlator.inject_span_context(event, ctx.as_ref()).await;
        }

        let receipt = if self.config.enable_immutable_trails {
            match self.writer.write(&event).await {
                Ok(receipt) => Some(receipt),
                Err(e) => {
                    self.metrics.record_persistence_error();
                    return Err(("persistence", e));
                }
            }
        } else {
            None
        };

        let record = match receipt {
            Some(ref r) => SequencedRecord {
                sequence_number: r.sequence_number,
                checksum: r.checksum.clone(),
                event: event.clone(),
            },
            None => SequencedRecord {
                sequence_number: self.unpersisted_seq.fetch_add(1, Ordering::SeqCst),
                checksum: crate::checksum::compute_checksum(&event, self.config.checksum_algorithm)
                    .map_err(|e| ("checksum", e))?,
                event: event.clone(),
            },
        };
        if let Err(e) = self.query_engine.index(&record).await {
            tracing::warn!(
                engine = self.query_engine.name(),
                sequence = record.sequence_number,
                error = %e,
                "Failed to index audit record"
            );
        }

        event.audit_uri = uri::create_event_uri(&event);
        let high_risk = event.risk_level() == Some(RiskLevel::High);
        let processed = ProcessedEvent { event, receipt };

        self.metrics.record_event(
            &processed.event.operation,
            start.elapsed(),
            annotation.is_some(),
            high_risk,
        );

        self.hub.publish(Notification::AuditEvent(processed.clone()));
        if let Some(annotation) = annotation {
            self.hub.publish(Notification::GovernanceEvent {
                annotation,
                event: processed.event.clone(),
            });
        }
        if high_risk {
            tracing::warn!(
                operation = %processed.event.operation,
                uri = processed.event.audit_uri.as_deref().unwrap_or(""),
                "High-risk audit event"
            );
            self.hub.publish(Notification::HighRiskEvent(processed.clone()));
        }

        if self.config.enable_webhooks {
            let transport = self.webhook_transport.clone();
            let delivered = processed.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.deliver(&delivered).await {
                    tracing::warn!(
                        transport = transport.name(),
                        operation = %delivered.event.operation,
                        error = %e,
                        "Webhook delivery failed"
                    );
                }
            });
        }

        tracing::debug!(
            sequence = processed.receipt.as_ref().map(|r| r.sequence_number),
            "Audit event processed"
        );
        Ok(processed)
    }

    fn record_failure(&self, stage: &str, error: &AuditError, operation: Option<&str>) {
        self.metrics.record_integration_error();
        tracing::warn!(stage, operation, error = %error, "Audit event failed");
        self.hub.publish(Notification::IntegrationError {
            stage: stage.to_string(),
            message: error.to_string(),
            operation: operation.map(str::to_string),
        });
    }
}

/// Checks for typed events, which bypass raw JSON parsing
fn validate_event(event: &AuditEvent) -> Result<()> {
    if event.operation.trim().is_empty() {
        return Err(AuditError::InvalidEvent(
            "operation must not be empty".to_string(),
        ));
    }
    if let Some(key) = event.non_finite_attribute() {
        return Err(AuditError::InvalidEvent(format!(
            "attribute '{}' is not a finite number",
            key
        )));
    }
    Ok(())
}

/// Parse a raw event, requiring an object with a non-empty `operation`
fn parse_raw_event(raw: serde_json::Value) -> Result<AuditEvent> {
    let object = raw
        .as_object()
        .ok_or_else(|| AuditError::InvalidEvent("event must be a JSON object".to_string()))?;
    match object.get("operation").and_then(|op| op.as_str()) {
        Some(op) if !op.trim().is_empty() => {}
        _ => {
            return Err(AuditError::InvalidEvent(
                "missing or empty 'operation'".to_string(),
            ))
        }
    }
    serde_json::from_value(raw).map_err(|e| AuditError::InvalidEvent(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ResourceUsage, StaticResourceProbe, CHECK_COORDINATOR};
    use crate::types::{AttributeValue, ComplianceFlag, EventStatus};
    use serde_json::json;

    fn coordinator(dir: &std::path::Path) -> AuditCoordinator {
        AuditCoordinator::builder(AuditConfig::with_dir(dir.join("audit")))
            .resource_probe(StaticResourceProbe(ResourceUsage::default()))
            .build()
    }

    #[tokio::test]
    async fn test_initialize_emits_notification() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let mut sub = c.subscribe();

        assert!(!c.is_initialized());
        c.initialize().await.unwrap();
        assert!(c.is_initialized());
        assert_eq!(sub.recv().await, Some(Notification::Initialized));

        // Second call is a no-op
        c.initialize().await.unwrap();
        assert!(sub.try_recv().is_none());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_fails_on_bad_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("audit");
        std::fs::write(&blocker, b"file").unwrap();

        let c = coordinator(tmp.path());
        assert!(matches!(
            c.initialize().await,
            Err(AuditError::Initialization(_))
        ));
        assert!(!c.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AuditConfig::with_dir(tmp.path());
        config.rotation_size = 0;
        let c = AuditCoordinator::new(config);
        assert!(matches!(
            c.initialize().await,
            Err(AuditError::Initialization(_))
        ));
    }

    #[tokio::test]
    async fn test_pipeline_annotates_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();

        let processed = c
            .process_event(json!({
                "operation": "data.access",
                "status": "ok",
                "traceId": "t1",
                "spanId": "s1",
                "attributes": {"data.personal": true}
            }))
            .await
            .unwrap();

        let g = processed.event.governance.as_ref().unwrap();
        assert_eq!(g.risk_level, RiskLevel::Low);
        assert!(g.compliance_flags.contains(&ComplianceFlag::Gdpr));
        assert_eq!(processed.event.audit_uri.as_deref(), Some("audit://events/t1/s1"));
        assert!(processed.event.open_telemetry.is_some());
        assert!(!processed.event.timestamp.is_empty());

        let receipt = processed.receipt.unwrap();
        assert_eq!(receipt.sequence_number, 0);

        // Persisted record does not carry the URI
        let records = crate::writer::read_log(&receipt.file).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].event.audit_uri.is_none());
        assert_eq!(records[0].checksum, receipt.checksum);

        let found = c.get_correlated_events("t1", "s1").await.unwrap();
        assert_eq!(found.operation, "data.access");
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_high_risk_notifications() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let mut sub = c.subscribe_kinds(&[
            NotificationKind::AuditEvent,
            NotificationKind::GovernanceEvent,
            NotificationKind::HighRiskEvent,
        ]);
        c.initialize().await.unwrap();

        c.process_event(json!({
            "operation": "security.violation",
            "status": "error",
            "attributes": {"security.violation": true}
        }))
        .await
        .unwrap();

        let kinds: Vec<_> = sub.drain().iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::AuditEvent,
                NotificationKind::GovernanceEvent,
                NotificationKind::HighRiskEvent
            ]
        );
        assert_eq!(c.metrics().high_risk_events, 1);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_event_counts_integration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let mut errors = c.subscribe_kinds(&[NotificationKind::IntegrationError]);
        c.initialize().await.unwrap();

        for raw in [
            json!("not an object"),
            json!({"status": "ok"}),
            json!({"operation": ""}),
            json!({"operation": "x", "status": "maybe"}),
            json!({"operation": "x", "attributes": {"k": null}}),
        ] {
            assert!(matches!(
                c.process_event(raw).await,
                Err(AuditError::InvalidEvent(_))
            ));
        }

        let m = c.metrics();
        assert_eq!(m.integration_errors, 5);
        assert_eq!(m.events_processed, 0);
        assert_eq!(errors.drain().len(), 5);
        assert!(c.is_initialized());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_timestamp_is_repaired() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();

        let processed = c
            .process_event(json!({"operation": "user.login", "timestamp": "yesterday"}))
            .await
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&processed.event.timestamp).is_ok());
        assert_eq!(
            processed.event.attributes.get(ORIGINAL_TIMESTAMP_ATTRIBUTE),
            Some(&AttributeValue::from("yesterday"))
        );

        // A missing timestamp has nothing to keep
        let processed = c.process_event(json!({"operation": "user.login"})).await.unwrap();
        assert!(!processed
            .event
            .attributes
            .contains_key(ORIGINAL_TIMESTAMP_ATTRIBUTE));
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_finite_attribute_rejected_before_write() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let mut errors = c.subscribe_kinds(&[NotificationKind::IntegrationError]);
        c.initialize().await.unwrap();

        let event =
            AuditEvent::new("metrics.report", EventStatus::Ok).with_attribute("ratio", f64::NAN);
        assert!(matches!(
            c.process_audit_event(event, None).await,
            Err(AuditError::InvalidEvent(_))
        ));

        let mut span = ExportedSpan::new("metrics.report", "t1", "s1");
        span.attributes
            .insert("drift".to_string(), AttributeValue::Float(f64::INFINITY));
        let results = c.export_spans(vec![span]).await;
        assert!(matches!(results[0], Err(AuditError::InvalidEvent(_))));

        assert_eq!(c.writer().event_count().await, 0);
        let m = c.metrics();
        assert_eq!(m.integration_errors, 2);
        assert_eq!(m.events_processed, 0);
        match errors.drain().first() {
            Some(Notification::IntegrationError { stage, operation, .. }) => {
                assert_eq!(stage, "validation");
                assert_eq!(operation.as_deref(), Some("metrics.report"));
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        // The log stays readable for the next event
        let ok =
            AuditEvent::new("metrics.report", EventStatus::Ok).with_attribute("ratio", 0.25);
        let receipt = c.process_audit_event(ok, None).await.unwrap().receipt.unwrap();
        assert_eq!(receipt.sequence_number, 0);
        let records = crate::writer::read_log(&receipt.file).await.unwrap();
        assert_eq!(records.len(), 1);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_unaddressable_trace_id_gets_no_uri() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();

        let processed = c
            .process_event(json!({"operation": "data.access", "traceId": "svc.trace:1", "spanId": "s1"}))
            .await
            .unwrap();
        assert!(processed.event.audit_uri.is_none());
        assert!(processed.receipt.is_some());

        let processed = c
            .process_event(json!({"operation": "data.access", "traceId": "svc-trace-1", "spanId": "s1"}))
            .await
            .unwrap();
        let uri = processed.event.audit_uri.unwrap();
        match c.resolve(&uri).await {
            Some(Resolution::Events(events)) => assert_eq!(events.len(), 1),
            other => panic!("unexpected resolution: {:?}", other),
        }
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_rejected_outside_running() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());

        let before = c.process_event(json!({"operation": "a"})).await;
        assert!(matches!(before, Err(AuditError::ShuttingDown)));

        c.initialize().await.unwrap();
        let mut sub = c.subscribe();
        c.shutdown().await;
        assert!(!c.is_initialized());
        assert_eq!(sub.recv().await, Some(Notification::Shutdown));

        let after = c.process_event(json!({"operation": "a"})).await;
        assert!(matches!(after, Err(AuditError::ShuttingDown)));
        assert_eq!(c.metrics().events_rejected, 2);
        assert!(matches!(
            c.initialize().await,
            Err(AuditError::Initialization(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_features() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AuditConfig::with_dir(tmp.path().join("audit"));
        config.enable_governance = false;
        config.enable_immutable_trails = false;
        config.enable_opentelemetry = false;
        let c = AuditCoordinator::new(config);
        let mut gov = c.subscribe_kinds(&[NotificationKind::GovernanceEvent]);
        c.initialize().await.unwrap();

        let processed = c
            .process_event(json!({"operation": "data.breach", "traceId": "t1", "spanId": "s1"}))
            .await
            .unwrap();
        assert!(processed.event.governance.is_none());
        assert!(processed.receipt.is_none());
        assert!(processed.event.open_telemetry.is_none());
        assert!(!tmp.path().join("audit").exists());
        assert!(gov.try_recv().is_none());

        // Still indexed and resolvable
        let resolved = c.resolve("audit://events/t1/s1").await;
        assert!(matches!(resolved, Some(Resolution::Events(ref e)) if e.len() == 1));
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_webhooks_delivered_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryWebhookTransport::new());
        let mut config = AuditConfig::with_dir(tmp.path().join("audit"));
        config.enable_webhooks = true;
        let c = AuditCoordinator::builder(config)
            .webhook_transport(transport.clone())
            .build();
        c.initialize().await.unwrap();

        c.register_webhook(WebhookConfig {
            url: "https://hooks.example.com/audit".to_string(),
            filters: EventFilter::default(),
        })
        .await
        .unwrap();
        c.process_event(json!({"operation": "user.update"})).await.unwrap();

        for _ in 0..50 {
            if !transport.deliveries().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(transport.deliveries().await.len(), 1);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_webhook_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();
        let result = c
            .register_webhook(WebhookConfig {
                url: "https://hooks.example.com".to_string(),
                filters: EventFilter::default(),
            })
            .await;
        assert!(matches!(result, Err(AuditError::Webhook(_))));
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_subscription() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();

        let spec = c
            .create_stream(
                "user-activity",
                EventFilter {
                    operation: Some("user.*".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut sub = c.subscribe_stream(&spec.stream_id).await.unwrap();
        assert!(c.subscribe_stream("stream-missing").await.is_err());

        c.process_event(json!({"operation": "user.login"})).await.unwrap();
        c.process_event(json!({"operation": "data.read"})).await.unwrap();

        let got = sub.drain();
        assert_eq!(got.len(), 1);
        match &got[0] {
            Notification::AuditEvent(p) => assert_eq!(p.event.operation, "user.login"),
            other => panic!("unexpected notification: {:?}", other),
        }
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_and_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();

        for op in ["cart.add", "cart.update", "checkout.complete"] {
            c.process_event(json!({"operation": op, "attributes": {"session.id": "sess-7"}}))
                .await
                .unwrap();
        }
        c.process_event(json!({"operation": "cart.add"})).await.unwrap();

        let filter = EventFilter {
            operation: Some("cart.*".to_string()),
            ..Default::default()
        };
        assert_eq!(c.query_events(&filter).await.unwrap().total, 3);
        assert!(c.query_events(&filter).await.unwrap().cache_hit);

        let m = c.metrics();
        assert_eq!(m.queries_executed, 2);
        assert!((m.cache_hit_ratio - 0.5).abs() < 1e-9);

        // URI resolution goes through the same query accounting
        let processed = c
            .process_event(json!({"operation": "cart.view", "traceId": "t7", "spanId": "s7"}))
            .await
            .unwrap();
        let uri = processed.event.audit_uri.unwrap();
        assert!(c.resolve(&uri).await.is_some());
        assert!(c.resolve(&uri).await.is_some());
        assert!(c.resolve("audit://nowhere").await.is_none());
        let m = c.metrics();
        assert_eq!(m.queries_executed, 4);
        assert!((m.cache_hit_ratio - 0.5).abs() < 1e-9);

        let replay = c.replay_session("sess-7", None).await.unwrap();
        let ops: Vec<_> = replay.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(ops, vec!["cart.add", "cart.update", "checkout.complete"]);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reflects_error_rate() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        c.initialize().await.unwrap();

        for i in 0..10 {
            c.process_event(json!({"operation": format!("op.{}", i)})).await.unwrap();
        }
        assert!(c.health_check().await.healthy);

        let _ = c.process_event(json!({"bad": true})).await;
        let _ = c.process_event(json!({"bad": true})).await;

        let report = c.health_check().await;
        assert!(!report.healthy);
        assert!(!report.checks[CHECK_COORDINATOR].healthy);
        assert!(report.alerts.iter().any(|a| a.component == CHECK_COORDINATOR));
        c.shutdown().await;
    }

    type SampledOn = Arc<std::sync::Mutex<Option<std::thread::ThreadId>>>;

    struct ThreadRecordingProbe(SampledOn);

    impl ResourceProbe for ThreadRecordingProbe {
        fn sample(&self) -> ResourceUsage {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            ResourceUsage::default()
        }
    }

    #[tokio::test]
    async fn test_resource_probe_sampled_on_blocking_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let sampled_on = SampledOn::default();
        let c = AuditCoordinator::builder(AuditConfig::with_dir(tmp.path().join("audit")))
            .resource_probe(ThreadRecordingProbe(sampled_on.clone()))
            .build();
        c.initialize().await.unwrap();

        c.health_check().await;
        let thread = sampled_on.lock().unwrap().expect("probe was sampled");
        assert_ne!(thread, std::thread::current().id());
        c.shutdown().await;
    }
}
