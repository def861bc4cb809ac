//! Health aggregation over pipeline counters
//!
//! Five independent checks (`auditCoordinator`, `webhookStreamer`,
//! `jsonlWriter`, `queryEngine`, `systemResources`) each pass or fail
//! against their own threshold. The overall verdict is the AND of all
//! checks; every failing check yields an alert whose severity grows with
//! how far the metric is past its threshold.

use crate::metrics::MetricsSnapshot;
use crate::provider::WebhookStats;
use crate::writer::WriterStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHECK_COORDINATOR: &str = "auditCoordinator";
pub const CHECK_WEBHOOKS: &str = "webhookStreamer";
pub const CHECK_WRITER: &str = "jsonlWriter";
pub const CHECK_QUERY_ENGINE: &str = "queryEngine";
pub const CHECK_RESOURCES: &str = "systemResources";

/// Per-check thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthThresholds {
    /// Max `integrationErrors / eventsProcessed`
    pub max_error_rate: f64,
    pub max_webhook_failure_rate: f64,
    /// Max `writeFailures / (eventsWritten + writeFailures)`
    pub max_writer_failure_rate: f64,
    pub max_avg_query_ms: f64,
    pub min_cache_hit_ratio: f64,
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_webhook_failure_rate: 0.10,
            max_writer_failure_rate: 0.05,
            max_avg_query_ms: 1000.0,
            min_cache_hit_ratio: 0.0,
            max_memory_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            max_cpu_percent: 90.0,
        }
    }
}

/// Alert severity, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    High,
    Critical,
}

impl AlertSeverity {
    /// Severity for an observed value past a ceiling
    pub fn for_excess(observed: f64, threshold: f64) -> Self {
        if threshold <= 0.0 || !observed.is_finite() {
            return AlertSeverity::Critical;
        }
        let ratio = observed / threshold;
        if ratio < 1.5 {
            AlertSeverity::Warning
        } else if ratio < 3.0 {
            AlertSeverity::High
        } else {
            AlertSeverity::Critical
        }
    }

    /// Severity for an observed value below a floor
    pub fn for_shortfall(observed: f64, floor: f64) -> Self {
        if observed <= 0.0 {
            return AlertSeverity::Critical;
        }
        Self::for_excess(floor, observed)
    }
}

/// A failing check, surfaced for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub component: String,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Result of one component check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCheck {
    pub healthy: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip)]
    severity: Option<AlertSeverity>,
}

impl ComponentCheck {
    fn pass(message: impl Into<String>, value: Option<f64>, threshold: Option<f64>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            value,
            threshold,
            severity: None,
        }
    }

    fn fail(
        message: impl Into<String>,
        severity: AlertSeverity,
        value: Option<f64>,
        threshold: Option<f64>,
    ) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            value,
            threshold,
            severity: Some(severity),
        }
    }
}

/// Qualitative band for the overall score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 1.0 {
            HealthStatus::Excellent
        } else if score >= 0.8 {
            HealthStatus::Good
        } else if score >= 0.6 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    /// Fraction of passing checks
    pub overall_score: f64,
    pub status: HealthStatus,
    pub passed: usize,
    pub total: usize,
    pub checked_at: String,
}

/// Composite health verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: BTreeMap<String, ComponentCheck>,
    pub alerts: Vec<Alert>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn check(&self, name: &str) -> Option<&ComponentCheck> {
        self.checks.get(name)
    }
}

/// Process resource usage; unknown values are `None` and pass their check
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

/// Source of resource usage samples
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reads resident memory from `/proc/self/status` where available
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessResourceProbe;

impl ResourceProbe for ProcessResourceProbe {
    fn sample(&self) -> ResourceUsage {
        let memory_bytes = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_rss(&status));
        ResourceUsage {
            memory_bytes,
            cpu_percent: None,
        }
    }
}

/// Fixed values, for tests and hosts that sample resources themselves
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticResourceProbe(pub ResourceUsage);

impl ResourceProbe for StaticResourceProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

/// Everything the monitor needs, gathered by the coordinator
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub initialized: bool,
    pub metrics: MetricsSnapshot,
    pub webhooks_enabled: bool,
    pub webhook_stats: WebhookStats,
    pub immutable_trails_enabled: bool,
    pub writer: WriterStats,
    /// Result of the query engine's own health call
    pub query_engine_reachable: bool,
    pub resources: ResourceUsage,
}

/// Stateless evaluator over [`HealthThresholds`]
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Run every check and build the report
    pub fn evaluate(&self, inputs: &HealthInputs) -> HealthReport {
        let mut checks = BTreeMap::new();
        checks.insert(CHECK_COORDINATOR.to_string(), self.check_coordinator(inputs));
        checks.insert(CHECK_WEBHOOKS.to_string(), self.check_webhooks(inputs));
        checks.insert(CHECK_WRITER.to_string(), self.check_writer(inputs));
        checks.insert(CHECK_QUERY_ENGINE.to_string(), self.check_query_engine(inputs));
        checks.insert(CHECK_RESOURCES.to_string(), self.check_resources(inputs));

        let alerts: Vec<Alert> = checks
            .iter()
            .filter_map(|(name, check)| {
                check.severity.map(|severity| Alert {
                    component: name.clone(),
                    severity,
                    message: check.message.clone(),
                })
            })
            .collect();

        let total = checks.len();
        let passed = checks.values().filter(|c| c.healthy).count();
        let overall_score = passed as f64 / total as f64;

        HealthReport {
            healthy: passed == total,
            checks,
            alerts,
            summary: HealthSummary {
                overall_score,
                status: HealthStatus::from_score(overall_score),
                passed,
                total,
                checked_at: crate::types::now_iso8601(),
            },
        }
    }

    fn check_coordinator(&self, inputs: &HealthInputs) -> ComponentCheck {
        let max = self.thresholds.max_error_rate;
        if !inputs.initialized {
            return ComponentCheck::fail(
                "Audit coordinator is not initialized",
                AlertSeverity::Critical,
                None,
                None,
            );
        }
        let rate = inputs.metrics.error_rate();
        if rate > max {
            return ComponentCheck::fail(
                format!(
                    "Integration error rate {:.2}% exceeds {:.2}% ({} errors / {} processed)",
                    rate * 100.0,
                    max * 100.0,
                    inputs.metrics.integration_errors,
                    inputs.metrics.events_processed
                ),
                AlertSeverity::for_excess(rate, max),
                Some(rate),
                Some(max),
            );
        }
        ComponentCheck::pass(
            format!("Error rate {:.2}%", rate * 100.0),
            Some(rate),
            Some(max),
        )
    }

    fn check_webhooks(&self, inputs: &HealthInputs) -> ComponentCheck {
        if !inputs.webhooks_enabled {
            return ComponentCheck::pass("Webhooks disabled", None, None);
        }
        let max = self.thresholds.max_webhook_failure_rate;
        let rate = inputs.webhook_stats.failure_rate();
        if rate > max {
            return ComponentCheck::fail(
                format!(
                    "Webhook failure rate {:.2}% exceeds {:.2}%",
                    rate * 100.0,
                    max * 100.0
                ),
                AlertSeverity::for_excess(rate, max),
                Some(rate),
                Some(max),
            );
        }
        ComponentCheck::pass(
            format!(
                "{} webhooks, {} delivered",
                inputs.webhook_stats.registered, inputs.webhook_stats.delivered
            ),
            Some(rate),
            Some(max),
        )
    }

    fn check_writer(&self, inputs: &HealthInputs) -> ComponentCheck {
        if !inputs.immutable_trails_enabled {
            return ComponentCheck::pass("Immutable trails disabled", None, None);
        }
        if !inputs.writer.open {
            return ComponentCheck::fail(
                "Audit writer is not open",
                AlertSeverity::Critical,
                None,
                None,
            );
        }
        let max = self.thresholds.max_writer_failure_rate;
        let attempts = inputs.writer.events_written + inputs.writer.write_failures;
        let rate = if attempts == 0 {
            0.0
        } else {
            inputs.writer.write_failures as f64 / attempts as f64
        };
        if rate > max {
            return ComponentCheck::fail(
                format!(
                    "Write failure rate {:.2}% exceeds {:.2}%",
                    rate * 100.0,
                    max * 100.0
                ),
                AlertSeverity::for_excess(rate, max),
                Some(rate),
                Some(max),
            );
        }
        ComponentCheck::pass(
            format!(
                "{} records written, {} rotations",
                inputs.writer.events_written, inputs.writer.rotations
            ),
            Some(rate),
            Some(max),
        )
    }

    fn check_query_engine(&self, inputs: &HealthInputs) -> ComponentCheck {
        if !inputs.query_engine_reachable {
            return ComponentCheck::fail(
                "Query engine health check failed",
                AlertSeverity::Critical,
                None,
                None,
            );
        }
        let avg = inputs.metrics.avg_query_time_ms;
        let max = self.thresholds.max_avg_query_ms;
        if avg > max {
            return ComponentCheck::fail(
                format!("Average query time {:.1}ms exceeds {:.1}ms", avg, max),
                AlertSeverity::for_excess(avg, max),
                Some(avg),
                Some(max),
            );
        }
        let ratio = inputs.metrics.cache_hit_ratio;
        let floor = self.thresholds.min_cache_hit_ratio;
        if inputs.metrics.queries_executed > 0 && ratio < floor {
            return ComponentCheck::fail(
                format!(
                    "Cache hit ratio {:.2} below {:.2}",
                    ratio, floor
                ),
                AlertSeverity::for_shortfall(ratio, floor),
                Some(ratio),
                Some(floor),
            );
        }
        ComponentCheck::pass(
            format!(
                "{} queries, avg {:.1}ms",
                inputs.metrics.queries_executed, avg
            ),
            Some(avg),
            Some(max),
        )
    }

    fn check_resources(&self, inputs: &HealthInputs) -> ComponentCheck {
        if let Some(mem) = inputs.resources.memory_bytes {
            let max = self.thresholds.max_memory_bytes;
            if mem > max {
                return ComponentCheck::fail(
                    format!("Memory {} bytes exceeds {} bytes", mem, max),
                    AlertSeverity::for_excess(mem as f64, max as f64),
                    Some(mem as f64),
                    Some(max as f64),
                );
            }
        }
        if let Some(cpu) = inputs.resources.cpu_percent {
            let max = self.thresholds.max_cpu_percent;
            if cpu > max {
                return ComponentCheck::fail(
                    format!("CPU {:.1}% exceeds {:.1}%", cpu, max),
                    AlertSeverity::for_excess(cpu, max),
                    Some(cpu),
                    Some(max),
                );
            }
        }
        ComponentCheck::pass(
            match inputs.resources.memory_bytes {
                Some(mem) => format!("Memory {} bytes", mem),
                None => "Resource usage unavailable".to_string(),
            },
            inputs.resources.memory_bytes.map(|m| m as f64),
            Some(self.thresholds.max_memory_bytes as f64),
        )
    }
}
