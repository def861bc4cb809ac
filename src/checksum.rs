//! Canonical serialization and per-event checksums
//!
//! A checksum covers the canonical JSON form of an [`AuditEvent`]: object
//! keys sorted recursively, no insignificant whitespace. The checksum string
//! carries its algorithm (`sha256:<hex>`) so a verifier can recompute it
//! without out-of-band configuration.

use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Hash function used for record checksums
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Hex digest of `data`
    pub fn digest_hex(self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(AuditError::Config(format!(
                "Unsupported checksum algorithm '{}'",
                other
            ))),
        }
    }
}

/// Canonical JSON text for a value: sorted keys, compact
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a &str cannot fail
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical serialization of an event
pub fn canonical_event(event: &AuditEvent) -> Result<String> {
    let value = serde_json::to_value(event)?;
    Ok(canonical_json(&value))
}

/// Compute the `<algorithm>:<hex>` checksum of an event
pub fn compute_checksum(event: &AuditEvent, algorithm: ChecksumAlgorithm) -> Result<String> {
    let canonical = canonical_event(event)?;
    Ok(format!(
        "{}:{}",
        algorithm,
        algorithm.digest_hex(canonical.as_bytes())
    ))
}

/// Recompute a checksum and compare it with the recorded one
///
/// The algorithm is taken from the recorded checksum's prefix.
pub fn verify_checksum(event: &AuditEvent, recorded: &str) -> Result<bool> {
    let (algo, _) = recorded
        .split_once(':')
        .ok_or_else(|| AuditError::InvalidEvent(format!("Malformed checksum '{}'", recorded)))?;
    let algorithm: ChecksumAlgorithm = algo.parse()?;
    Ok(compute_checksum(event, algorithm)? == recorded)
}
