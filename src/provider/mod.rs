//! Collaborator contracts for the query engine and webhook transport
//!
//! The pipeline persists and classifies events itself, but indexing/querying
//! and webhook delivery belong to pluggable backends. Both are async traits
//! so a real index or HTTP transport can replace the in-memory defaults
//! without touching the coordinator.

use crate::error::Result;
use crate::types::{AttributeValue, AuditEvent, ProcessedEvent, RiskLevel, SequencedRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod memory;

/// Attribute key used to group events into a replayable session
pub const SESSION_ATTRIBUTE: &str = "session.id";

/// Output format requested from the query engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    #[default]
    Json,
    Jsonl,
}

/// Event filter shared by queries, streams, and webhooks
///
/// Every set field must match; `attributes` is a sub-match (each listed
/// key must be present with an equal value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// Exact operation name, or a prefix when it ends with `*`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Only events at or after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    pub format: QueryFormat,
}

impl EventFilter {
    /// Filter for one trace/span pair
    pub fn for_span(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            span_id: Some(span_id.into()),
            ..Default::default()
        }
    }

    /// Check if an event matches this filter (ignores `limit`/`format`).
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref t) = self.trace_id {
            if event.trace_id.as_deref() != Some(t.as_str()) {
                return false;
            }
        }
        if let Some(ref s) = self.span_id {
            if event.span_id.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(ref op) = self.operation {
            let hit = match op.strip_suffix('*') {
                Some(prefix) => event.operation.starts_with(prefix),
                None => event.operation == *op,
            };
            if !hit {
                return false;
            }
        }
        if let Some(level) = self.risk_level {
            if event.risk_level() != Some(level) {
                return false;
            }
        }
        if let Some(ref sid) = self.session_id {
            let session = event.attributes.get(SESSION_ATTRIBUTE).and_then(|v| v.as_str());
            if session != Some(sid.as_str()) {
                return false;
            }
        }
        for (key, expected) in &self.attributes {
            if event.attributes.get(key) != Some(expected) {
                return false;
            }
        }
        if let Some(since) = self.since {
            match chrono::DateTime::parse_from_rfc3339(&event.timestamp) {
                Ok(ts) if ts.with_timezone(&chrono::Utc) >= since => {}
                _ => return false,
            }
        }
        true
    }
}

/// Query response from the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub events: Vec<AuditEvent>,
    /// Matches before `limit` was applied
    pub total: usize,
    /// Whether the engine served this from its cache
    pub cache_hit: bool,
}

/// A named, filtered live stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    pub stream_id: String,
    pub name: String,
    pub filter: EventFilter,
}

/// Webhook registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub filters: EventFilter,
}

/// Delivery counters reported by a webhook transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub registered: usize,
    pub delivered: u64,
    pub failed: u64,
}

impl WebhookStats {
    /// Failed / attempted; 0 when nothing was attempted
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.delivered + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.failed as f64 / attempted as f64
        }
    }
}

/// Query/index backend
///
/// Reads may lag slightly behind the latest write.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Make a persisted record queryable
    async fn index(&self, record: &SequencedRecord) -> Result<()>;

    async fn query_events(&self, filter: &EventFilter) -> Result<QueryResult>;

    /// Register a stream, returning it with its assigned id
    async fn create_stream(&self, name: &str, filter: EventFilter) -> Result<StreamSpec>;

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamSpec>>;

    /// Events of one session (by `session.id` attribute), oldest first
    async fn replay_session(
        &self,
        session_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<AuditEvent>>;

    /// Returns true if the engine is operational
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }

    /// Engine name (e.g. "memory")
    fn name(&self) -> &str;
}

/// Webhook delivery backend; retries and backoff are its own concern
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Register a webhook, returning its URI
    async fn register(&self, config: WebhookConfig) -> Result<String>;

    /// Deliver one processed event to every matching webhook
    async fn deliver(&self, event: &ProcessedEvent) -> Result<()>;

    fn stats(&self) -> WebhookStats;

    fn name(&self) -> &str;
}
