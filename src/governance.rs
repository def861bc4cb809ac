//! Governance classification: risk level, compliance flags, retention
//!
//! Classification is a pure function of an event's operation, status, and
//! attributes. Keyword lists, compliance rules, and retention years come from
//! a configurable [`GovernanceConfig`] table.

use crate::types::{
    AuditEvent, ComplianceFlag, EventStatus, GovernanceAnnotation, RetentionPolicy, RiskLevel,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute keys that imply a compliance flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceRule {
    pub flag: ComplianceFlag,
    pub attributes: Vec<String>,
}

impl ComplianceRule {
    fn new(flag: ComplianceFlag, attributes: &[&str]) -> Self {
        Self {
            flag,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Classification tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GovernanceConfig {
    /// Attributes that, on an error event, signal a security/compliance violation
    pub violation_attributes: Vec<String>,
    /// Operation substrings that make an event high risk
    pub high_risk_keywords: Vec<String>,
    /// Operation substrings that make an event medium risk
    pub medium_risk_keywords: Vec<String>,
    pub compliance_rules: Vec<ComplianceRule>,
    /// Minimum retention per flag, in years
    pub retention_years: BTreeMap<ComplianceFlag, u32>,
    /// Retention when no flag matched
    pub default_retention_years: u32,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            violation_attributes: strings(&["security.violation", "compliance.violation"]),
            high_risk_keywords: strings(&["breach", "violation", "unauthorized"]),
            medium_risk_keywords: strings(&["write", "update", "delete"]),
            compliance_rules: vec![
                ComplianceRule::new(ComplianceFlag::Gdpr, &["data.personal", "personal.data", "pii"]),
                ComplianceRule::new(ComplianceFlag::Sox, &["financial.data", "financial.transaction"]),
                ComplianceRule::new(ComplianceFlag::Hipaa, &["health.data", "phi"]),
                ComplianceRule::new(ComplianceFlag::Pci, &["payment.card", "card.number"]),
            ],
            retention_years: [
                (ComplianceFlag::Sox, 7),
                (ComplianceFlag::Hipaa, 6),
                (ComplianceFlag::Gdpr, 3),
                (ComplianceFlag::Pci, 1),
            ]
            .into_iter()
            .collect(),
            default_retention_years: 1,
        }
    }
}

/// Stateless classifier over a [`GovernanceConfig`]
#[derive(Debug, Clone, Default)]
pub struct GovernanceClassifier {
    config: GovernanceConfig,
}

impl GovernanceClassifier {
    pub fn new(config: GovernanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Derive the full annotation for an event
    pub fn classify(&self, event: &AuditEvent) -> GovernanceAnnotation {
        let compliance_flags = self.compliance_flags(event);
        let retention_policy = self.retention_policy(&compliance_flags);
        GovernanceAnnotation {
            risk_level: self.assess_risk(event),
            compliance_flags,
            retention_policy,
        }
    }

    /// First matching rule wins:
    /// 1. error + violation attribute → high
    /// 2. high-risk keyword in operation → high
    /// 3. medium-risk keyword or error status → medium
    /// 4. low
    pub fn assess_risk(&self, event: &AuditEvent) -> RiskLevel {
        let is_error = event.status == EventStatus::Error;
        if is_error
            && self
                .config
                .violation_attributes
                .iter()
                .any(|a| event.has_signal(a))
        {
            return RiskLevel::High;
        }

        let operation = event.operation.to_lowercase();
        if contains_any(&operation, &self.config.high_risk_keywords) {
            return RiskLevel::High;
        }
        if is_error || contains_any(&operation, &self.config.medium_risk_keywords) {
            return RiskLevel::Medium;
        }
        RiskLevel::Low
    }

    /// Union of every flag whose rule matches
    pub fn compliance_flags(&self, event: &AuditEvent) -> BTreeSet<ComplianceFlag> {
        self.config
            .compliance_rules
            .iter()
            .filter(|rule| rule.attributes.iter().any(|a| event.has_signal(a)))
            .map(|rule| rule.flag)
            .collect()
    }

    /// Longest retention among `flags`; ties go to the higher-priority flag
    pub fn retention_policy(&self, flags: &BTreeSet<ComplianceFlag>) -> RetentionPolicy {
        flags
            .iter()
            .map(|flag| {
                let years = self
                    .config
                    .retention_years
                    .get(flag)
                    .copied()
                    .unwrap_or(self.config.default_retention_years);
                (years, flag.priority(), *flag)
            })
            .max()
            .map(|(years, _, flag)| RetentionPolicy {
                years,
                reason: flag.to_string(),
            })
            .unwrap_or_else(|| RetentionPolicy {
                years: self.config.default_retention_years,
                reason: "default".to_string(),
            })
    }
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
}
