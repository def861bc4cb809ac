//! # a3s-audit
//!
//! Tamper-evident audit event ingestion for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-audit` accepts structured operation events, correlates them with
//! distributed-tracing context, classifies them for governance risk, and
//! appends them to a checksummed, sequenced JSONL log with size-based
//! rotation. Processed events fan out to subscribers, a pluggable query
//! engine, and webhooks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_audit::{AuditConfig, AuditCoordinator};
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let coordinator = AuditCoordinator::new(AuditConfig::with_dir("/var/log/a3s-audit"));
//! coordinator.initialize().await?;
//!
//! let processed = coordinator
//!     .process_event(serde_json::json!({
//!         "operation": "data.access",
//!         "status": "ok",
//!         "traceId": "4bf92f3577b34da6",
//!         "spanId": "00f067aa0ba902b7",
//!         "attributes": {"data.personal": true}
//!     }))
//!     .await?;
//!
//! println!("{:?}", processed.event.audit_uri);
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ChecksumWriter**: append-only log, one `SequencedRecord` per line
//! - **SpanCorrelator**: trace context injection and `(traceId, spanId)` lookup
//! - **GovernanceClassifier**: risk level, compliance flags, retention policy
//! - **MetricsCollector** / **HealthMonitor**: counters and health verdicts
//! - **AuditCoordinator**: the pipeline and its query/stream/webhook entry points
//! - **QueryEngine** / **WebhookTransport** traits: pluggable collaborators

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod governance;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod provider;
pub mod types;
pub mod uri;
pub mod writer;

// Re-export core types
pub use checksum::{compute_checksum, verify_checksum, ChecksumAlgorithm};
pub use config::AuditConfig;
pub use coordinator::{AuditCoordinator, AuditCoordinatorBuilder};
pub use correlation::{ExportedSpan, SpanContext, SpanCorrelator};
pub use error::{AuditError, Result};
pub use governance::{ComplianceRule, GovernanceClassifier, GovernanceConfig};
pub use health::{
    Alert, AlertSeverity, HealthMonitor, HealthReport, HealthStatus, HealthThresholds,
    ResourceProbe, ResourceUsage,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use notify::{Notification, NotificationKind, Subscription};
pub use provider::{
    EventFilter, QueryEngine, QueryFormat, QueryResult, StreamSpec, WebhookConfig,
    WebhookStats, WebhookTransport,
};
pub use types::{
    AttributeValue, Attributes, AuditEvent, ComplianceFlag, EventStatus, GovernanceAnnotation,
    ProcessedEvent, RetentionPolicy, RiskLevel, SequencedRecord, WriteReceipt,
};
pub use uri::{create_event_uri, create_stream_uri, AuditUri, Resolution};
pub use writer::{read_log, verify_log, ChecksumWriter, VerificationReport, WriterOptions};

// Re-export in-memory collaborators for convenience
pub use provider::memory::{MemoryEngineConfig, MemoryQueryEngine, MemoryWebhookTransport};
