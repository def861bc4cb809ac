//! `audit://` addressing
//!
//! Two forms:
//! - `audit://events/{traceId}/{spanId}`: events of one trace/span
//! - `audit://streams/{streamId}`: a named, filtered live stream
//!
//! URIs are built deterministically from their inputs; resolving them needs a
//! [`QueryEngine`].

use crate::correlation::is_valid_id;
use crate::error::{AuditError, Result};
use crate::provider::{EventFilter, QueryEngine, QueryFormat, StreamSpec};
use crate::types::AuditEvent;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub const SCHEME: &str = "audit://";

/// A parsed audit URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditUri {
    Events { trace_id: String, span_id: String },
    Stream { stream_id: String },
}

impl AuditUri {
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix(SCHEME)
            .ok_or_else(|| AuditError::Uri(format!("missing {} scheme: {}", SCHEME, input)))?;

        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            ["events", trace_id, span_id] if is_valid_id(trace_id) && is_valid_id(span_id) => {
                Ok(AuditUri::Events {
                    trace_id: trace_id.to_string(),
                    span_id: span_id.to_string(),
                })
            }
            ["streams", stream_id] if is_valid_id(stream_id) => Ok(AuditUri::Stream {
                stream_id: stream_id.to_string(),
            }),
            _ => Err(AuditError::Uri(format!("unrecognized audit URI: {}", input))),
        }
    }
}

impl FromStr for AuditUri {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for AuditUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditUri::Events { trace_id, span_id } => {
                write!(f, "{}events/{}/{}", SCHEME, trace_id, span_id)
            }
            AuditUri::Stream { stream_id } => write!(f, "{}streams/{}", SCHEME, stream_id),
        }
    }
}

/// URI for an event's trace/span.
///
/// `None` when either id is missing or is not a valid id, so every URI
/// produced here parses back with [`AuditUri::parse`].
pub fn create_event_uri(event: &AuditEvent) -> Option<String> {
    let trace_id = event.trace_id.as_deref().filter(|t| is_valid_id(t))?;
    let span_id = event.span_id.as_deref().filter(|s| is_valid_id(s))?;
    Some(
        AuditUri::Events {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
        }
        .to_string(),
    )
}

pub fn create_stream_uri(stream_id: &str) -> String {
    AuditUri::Stream {
        stream_id: stream_id.to_string(),
    }
    .to_string()
}

/// What a URI resolved to
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Events(Vec<AuditEvent>),
    Stream(StreamSpec),
}

/// Resolve a URI against the query engine.
///
/// Malformed or unknown URIs resolve to `None`. A well-formed URI with no
/// match resolves to an empty list (events) or `None` (unknown stream).
/// Engine errors are logged and degrade to an empty result.
pub async fn resolve(uri: &str, engine: &dyn QueryEngine) -> Option<Resolution> {
    resolve_observed(uri, engine, |_, _| {}).await
}

/// [`resolve`], reporting the duration and cache outcome of any event query
pub async fn resolve_observed(
    uri: &str,
    engine: &dyn QueryEngine,
    on_query: impl FnOnce(Duration, bool),
) -> Option<Resolution> {
    let parsed = match AuditUri::parse(uri) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(uri, error = %e, "Ignoring unresolvable audit URI");
            return None;
        }
    };

    match parsed {
        AuditUri::Events { trace_id, span_id } => {
            let filter = EventFilter {
                limit: Some(1),
                format: QueryFormat::Json,
                ..EventFilter::for_span(trace_id, span_id)
            };
            let start = Instant::now();
            match engine.query_events(&filter).await {
                Ok(result) => {
                    on_query(start.elapsed(), result.cache_hit);
                    Some(Resolution::Events(result.events))
                }
                Err(e) => {
                    tracing::warn!(uri, engine = engine.name(), error = %e, "Audit URI query failed");
                    Some(Resolution::Events(Vec::new()))
                }
            }
        }
        AuditUri::Stream { stream_id } => match engine.stream(&stream_id).await {
            Ok(spec) => spec.map(Resolution::Stream),
            Err(e) => {
                tracing::warn!(uri, engine = engine.name(), error = %e, "Audit URI stream lookup failed");
                None
            }
        },
    }
}
