//! Links audit events to the spans that produced them
//!
//! The correlator copies trace context onto events and keeps the latest
//! event per `(traceId, spanId)` for lookup while debugging. Entries are
//! purely in-memory and swept by age.

use crate::types::{Attributes, AuditEvent, EventStatus, OpenTelemetryContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Active trace context handed over by the tracing layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub trace_flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
}

impl SpanContext {
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            trace_flags: 0,
            trace_state: None,
        }
    }

    /// Context from an event's own `traceId`/`spanId`, when both are set
    pub fn from_event_ids(event: &AuditEvent) -> Option<Self> {
        match (&event.trace_id, &event.span_id) {
            (Some(t), Some(s)) => Some(Self::new(t.clone(), s.clone())),
            _ => None,
        }
    }

    /// Both ids non-empty and restricted to `[A-Za-z0-9_-]`
    pub fn is_valid(&self) -> bool {
        is_valid_id(&self.trace_id) && is_valid_id(&self.span_id)
    }
}

pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone)]
struct CorrelationEntry {
    event: AuditEvent,
    inserted_at: Instant,
}

/// In-memory `(traceId, spanId)` → latest event table
#[derive(Default)]
pub struct SpanCorrelator {
    entries: RwLock<HashMap<(String, String), CorrelationEntry>>,
}

impl SpanCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `ctx` onto the event and index it.
    ///
    /// A missing or malformed context leaves the event without an
    /// `openTelemetry` field and unindexed.
    pub async fn inject_span_context(
        &self,
        mut event: AuditEvent,
        ctx: Option<&SpanContext>,
    ) -> AuditEvent {
        let ctx = match ctx {
            Some(ctx) if ctx.is_valid() => ctx,
            Some(ctx) => {
                tracing::debug!(
                    trace_id = %ctx.trace_id,
                    span_id = %ctx.span_id,
                    "Ignoring malformed span context"
                );
                return event;
            }
            None => return event,
        };

        event.trace_id = Some(ctx.trace_id.clone());
        event.span_id = Some(ctx.span_id.clone());
        event.open_telemetry = Some(OpenTelemetryContext {
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.span_id.clone(),
            trace_flags: ctx.trace_flags,
            trace_state: ctx.trace_state.clone(),
        });

        let mut entries = self.entries.write().await;
        entries.insert(
            (ctx.trace_id.clone(), ctx.span_id.clone()),
            CorrelationEntry {
                event: event.clone(),
                inserted_at: Instant::now(),
            },
        );
        event
    }

    /// Read the trace context back from a previously injected event
    pub fn extract_span_context(event: &AuditEvent) -> Option<SpanContext> {
        event.open_telemetry.as_ref().map(|otel| SpanContext {
            trace_id: otel.trace_id.clone(),
            span_id: otel.span_id.clone(),
            trace_flags: otel.trace_flags,
            trace_state: otel.trace_state.clone(),
        })
    }

    /// Most recent event seen for the key
    pub async fn get_correlated_events(&self, trace_id: &str, span_id: &str) -> Option<AuditEvent> {
        let entries = self.entries.read().await;
        entries
            .get(&(trace_id.to_string(), span_id.to_string()))
            .map(|e| e.event.clone())
    }

    /// Remove entries at least `max_age` old; returns how many were removed
    pub async fn cleanup_old_correlations(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < max_age);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Spawn the periodic sweep.
///
/// Runs every `interval` until `shutdown` flips to `true` or its sender drops.
pub fn spawn_cleanup_task(
    correlator: Arc<SpanCorrelator>,
    interval: Duration,
    max_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = correlator.cleanup_old_correlations(max_age).await;
                    if removed > 0 {
                        tracing::debug!(removed, "Swept stale trace correlations");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Correlation cleanup task stopped");
    })
}

/// A finished span as handed over by a trace exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSpan {
    /// Span name, used as the audit operation
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub trace_flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
    #[serde(default)]
    pub status: EventStatus,
    /// ISO-8601 span start; the event is stamped "now" when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ExportedSpan {
    pub fn new(
        name: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            trace_flags: 0,
            trace_state: None,
            status: EventStatus::Ok,
            start_time: None,
            attributes: Attributes::new(),
        }
    }

    /// Split into the audit event and the context to inject into it
    pub fn into_event(self) -> (AuditEvent, SpanContext) {
        let ctx = SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            trace_flags: self.trace_flags,
            trace_state: self.trace_state,
        };
        let mut event = AuditEvent::new(self.name, self.status);
        if let Some(start) = self.start_time {
            event.timestamp = start;
        }
        event.attributes = self.attributes;
        (event, ctx)
    }
}
