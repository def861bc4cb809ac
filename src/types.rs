//! Core audit types for the a3s-audit pipeline
//!
//! All types use camelCase JSON serialization; the persisted log and the
//! notification payloads share these shapes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Attribute bag attached to an audit event (ordered by key)
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single attribute value
///
/// A closed set of JSON-like variants. `null` is not representable;
/// raw events carrying it fail validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Whether this value signals the presence of its key.
    ///
    /// Everything except an explicit `false` counts.
    pub fn is_signalled(&self) -> bool {
        !matches!(self, AttributeValue::Bool(false))
    }

    /// Whether every number in this value can be written to JSON.
    ///
    /// NaN and infinities serialize as `null`, which does not read back.
    pub fn is_finite(&self) -> bool {
        match self {
            AttributeValue::Float(f) => f.is_finite(),
            AttributeValue::List(items) => items.iter().all(AttributeValue::is_finite),
            AttributeValue::Map(entries) => entries.values().all(AttributeValue::is_finite),
            _ => true,
        }
    }

    /// String view, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

/// Outcome of the audited operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Ok,
    Error,
}

/// Trace context copied onto an event by the span correlator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTelemetryContext {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
}

/// Regulatory risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => f.write_str("low"),
            RiskLevel::Medium => f.write_str("medium"),
            RiskLevel::High => f.write_str("high"),
        }
    }
}

/// Compliance regime implied by an event's attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceFlag {
    Gdpr,
    Sox,
    Hipaa,
    Pci,
}

impl ComplianceFlag {
    /// Tie-break rank when two flags demand the same retention (higher wins)
    pub fn priority(self) -> u8 {
        match self {
            ComplianceFlag::Sox => 3,
            ComplianceFlag::Hipaa => 2,
            ComplianceFlag::Gdpr => 1,
            ComplianceFlag::Pci => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceFlag::Gdpr => "gdpr",
            ComplianceFlag::Sox => "sox",
            ComplianceFlag::Hipaa => "hipaa",
            ComplianceFlag::Pci => "pci",
        }
    }
}

impl fmt::Display for ComplianceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long an event must be retained, and which regime demands it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub years: u32,
    pub reason: String,
}

/// Governance classification attached to an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceAnnotation {
    pub risk_level: RiskLevel,
    pub compliance_flags: BTreeSet<ComplianceFlag>,
    pub retention_policy: RetentionPolicy,
}

/// A single audit event
///
/// Mutated in place by the pipeline (governance, trace context) until it
/// is written; after that the persisted bytes never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// ISO-8601 timestamp; repaired to "now" by the coordinator when invalid
    #[serde(default)]
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Dot-namespaced operation name (e.g. "data.access")
    pub operation: String,

    #[serde(default)]
    pub status: EventStatus,

    #[serde(default)]
    pub attributes: Attributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_telemetry: Option<OpenTelemetryContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance: Option<GovernanceAnnotation>,

    #[serde(
        default,
        rename = "auditURI",
        skip_serializing_if = "Option::is_none"
    )]
    pub audit_uri: Option<String>,
}

impl AuditEvent {
    /// Create an event stamped with the current time
    pub fn new(operation: impl Into<String>, status: EventStatus) -> Self {
        Self {
            timestamp: now_iso8601(),
            trace_id: None,
            span_id: None,
            operation: operation.into(),
            status,
            attributes: Attributes::new(),
            open_telemetry: None,
            governance: None,
            audit_uri: None,
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set trace and span identifiers
    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    /// Whether `key` is present with a signalling value
    pub fn has_signal(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .map(AttributeValue::is_signalled)
            .unwrap_or(false)
    }

    /// First attribute key holding a NaN or infinite number
    pub fn non_finite_attribute(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(k, _)| k.as_str())
    }

    /// Risk level from the governance annotation, if classified
    pub fn risk_level(&self) -> Option<RiskLevel> {
        self.governance.as_ref().map(|g| g.risk_level)
    }
}

/// One persisted line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedRecord {
    /// 0-based, strictly increasing per writer session
    pub sequence_number: u64,

    /// `<algorithm>:<hex digest>` over the canonical event serialization
    pub checksum: String,

    pub event: AuditEvent,
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub sequence_number: u64,
    pub checksum: String,
    /// Log file the record landed in
    pub file: PathBuf,
}

/// An event after the pipeline has run
///
/// `event` is the in-memory copy (with `auditURI`), `receipt` is present
/// when immutable trails are enabled and the write succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<WriteReceipt>,
}

/// Current time as an RFC 3339 / ISO-8601 string with millisecond precision
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
