//! Coordinator configuration

use crate::checksum::ChecksumAlgorithm;
use crate::error::{AuditError, Result};
use crate::governance::GovernanceConfig;
use crate::health::HealthThresholds;
use crate::writer::WriterOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for [`AuditCoordinator`](crate::AuditCoordinator)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    /// Directory holding the JSONL audit trail
    pub audit_dir: PathBuf,

    /// Log file name prefix
    pub file_prefix: String,

    /// File size in bytes that triggers rotation
    pub rotation_size: u64,

    /// Deliver processed events to registered webhooks
    pub enable_webhooks: bool,

    /// Attach governance annotations
    pub enable_governance: bool,

    /// Persist events to the checksummed log
    pub enable_immutable_trails: bool,

    /// Inject trace context and keep the correlation table
    pub enable_opentelemetry: bool,

    pub checksum_algorithm: ChecksumAlgorithm,

    /// Correlation entries older than this are swept
    pub correlation_max_age_ms: u64,

    /// How often the correlation sweep runs
    pub correlation_cleanup_interval_ms: u64,

    pub governance: GovernanceConfig,

    pub health: HealthThresholds,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            audit_dir: PathBuf::from("audit"),
            file_prefix: "audit".to_string(),
            rotation_size: 10 * 1024 * 1024, // 10 MB
            enable_webhooks: false,
            enable_governance: true,
            enable_immutable_trails: true,
            enable_opentelemetry: true,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            correlation_max_age_ms: 3_600_000,
            correlation_cleanup_interval_ms: 60_000,
            governance: GovernanceConfig::default(),
            health: HealthThresholds::default(),
        }
    }
}

impl AuditConfig {
    /// Config rooted at `audit_dir`, everything else default
    pub fn with_dir(audit_dir: impl Into<PathBuf>) -> Self {
        Self {
            audit_dir: audit_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| AuditError::Config(e.to_string()))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AuditError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.enable_immutable_trails && self.audit_dir.as_os_str().is_empty() {
            return Err(AuditError::Config("auditDir must not be empty".to_string()));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains(['/', '\\']) {
            return Err(AuditError::Config(format!(
                "Invalid filePrefix '{}'",
                self.file_prefix
            )));
        }
        if self.rotation_size == 0 {
            return Err(AuditError::Config("rotationSize must be > 0".to_string()));
        }
        if self.correlation_cleanup_interval_ms == 0 {
            return Err(AuditError::Config(
                "correlationCleanupIntervalMs must be > 0".to_string(),
            ));
        }
        let h = &self.health;
        let ratios = [
            ("maxErrorRate", h.max_error_rate),
            ("maxWebhookFailureRate", h.max_webhook_failure_rate),
            ("maxWriterFailureRate", h.max_writer_failure_rate),
            ("minCacheHitRatio", h.min_cache_hit_ratio),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(AuditError::Config(format!(
                    "health.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            dir: self.audit_dir.clone(),
            prefix: self.file_prefix.clone(),
            rotation_size: self.rotation_size,
            algorithm: self.checksum_algorithm,
        }
    }

    pub fn correlation_max_age(&self) -> Duration {
        Duration::from_millis(self.correlation_max_age_ms)
    }

    pub fn correlation_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.correlation_cleanup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert!(!config.enable_webhooks);
        assert!(config.enable_governance);
        assert!(config.enable_immutable_trails);
        assert!(config.enable_opentelemetry);
        assert_eq!(config.rotation_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "auditDir": "/var/log/a3s",
            "rotationSize": 4096,
            "enableWebhooks": true,
            "checksumAlgorithm": "sha512",
            "health": {"maxErrorRate": 0.2}
        }"#;
        let config = AuditConfig::from_json_str(json).unwrap();
        assert_eq!(config.audit_dir, PathBuf::from("/var/log/a3s"));
        assert_eq!(config.rotation_size, 4096);
        assert!(config.enable_webhooks);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Sha512);
        assert_eq!(config.health.max_error_rate, 0.2);
        assert_eq!(config.health.max_webhook_failure_rate, 0.10);
        assert_eq!(config.file_prefix, "audit");

        let opts = config.writer_options();
        assert_eq!(opts.rotation_size, 4096);
        assert_eq!(opts.algorithm, ChecksumAlgorithm::Sha512);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            AuditConfig::from_json_str("{\"rotationSize\": \"big\"}"),
            Err(AuditError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = AuditConfig::default();
        config.rotation_size = 0;
        assert!(config.validate().is_err());

        let mut config = AuditConfig::default();
        config.file_prefix = "a/b".to_string();
        assert!(config.validate().is_err());

        let mut config = AuditConfig::default();
        config.health.max_error_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = AuditConfig::default();
        config.correlation_cleanup_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.json");
        std::fs::write(&path, r#"{"filePrefix": "trail"}"#).unwrap();

        let config = AuditConfig::from_file(&path).await.unwrap();
        assert_eq!(config.file_prefix, "trail");

        assert!(matches!(
            AuditConfig::from_file(tmp.path().join("missing.json")).await,
            Err(AuditError::Config(_))
        ));
    }
}
