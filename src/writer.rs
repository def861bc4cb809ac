//! Append-only JSONL audit writer with checksums and size-based rotation.
//!
//! Every record is one line: `{"sequenceNumber":N,"checksum":"sha256:..","event":{..}}`.
//! Sequence assignment, the size check, rotation, and the append run under a
//! single lock, so concurrent callers never share a sequence number and never
//! interleave partial lines. Rotated files are left untouched.

use crate::checksum::{compute_checksum, verify_checksum, ChecksumAlgorithm};
use crate::error::{AuditError, Result};
use crate::types::{AuditEvent, SequencedRecord, WriteReceipt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Writer settings
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Directory holding the log files
    pub dir: PathBuf,
    /// File name prefix (default: `"audit"`)
    pub prefix: String,
    /// Size threshold in bytes that triggers rotation
    pub rotation_size: u64,
    pub algorithm: ChecksumAlgorithm,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("audit"),
            prefix: "audit".to_string(),
            rotation_size: 10 * 1024 * 1024, // 10 MB
            algorithm: ChecksumAlgorithm::Sha256,
        }
    }
}

/// Point-in-time writer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub events_written: u64,
    pub write_failures: u64,
    pub rotations: u64,
    pub current_file: Option<PathBuf>,
    pub current_file_bytes: u64,
    pub open: bool,
}

struct WriterState {
    file: Option<fs::File>,
    path: Option<PathBuf>,
    /// Bytes in the current file
    size: u64,
    /// Index of the current file within this session
    file_index: u64,
    /// Records written this session; also the next sequence number
    event_count: u64,
    write_failures: u64,
    rotations: u64,
    /// Set after a failed append so the next record starts a fresh file
    force_rotate: bool,
    closed: bool,
    files: Vec<PathBuf>,
}

/// Append-only checksum writer
pub struct ChecksumWriter {
    options: WriterOptions,
    /// Unique per writer instance; scopes file names and the sequence space
    session: String,
    state: Mutex<WriterState>,
}

impl ChecksumWriter {
    /// Create a writer. No I/O happens until [`open`](Self::open).
    pub fn new(options: WriterOptions) -> Self {
        let session = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            options,
            session,
            state: Mutex::new(WriterState {
                file: None,
                path: None,
                size: 0,
                file_index: 0,
                event_count: 0,
                write_failures: 0,
                rotations: 0,
                force_rotate: false,
                closed: false,
                files: Vec::new(),
            }),
        }
    }

    /// Create the audit directory and the first log file.
    ///
    /// Failure here is an initialization error.
    pub async fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.options.dir).await.map_err(|e| {
            AuditError::Initialization(format!(
                "Failed to create audit directory {}: {}",
                self.options.dir.display(),
                e
            ))
        })?;

        let mut state = self.state.lock().await;
        if state.file.is_some() {
            return Ok(());
        }
        state.closed = false;
        self.open_next(&mut state)
            .await
            .map_err(|e| AuditError::Initialization(e.to_string()))?;

        tracing::info!(
            dir = %self.options.dir.display(),
            session = %self.session,
            rotation_size = self.options.rotation_size,
            "Audit writer opened"
        );
        Ok(())
    }

    /// Persist one event and return its sequence number and checksum.
    ///
    /// Storage failures propagate; nothing is retried here.
    pub async fn write(&self, event: &AuditEvent) -> Result<WriteReceipt> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AuditError::WriterClosed);
        }

        let sequence_number = state.event_count;
        let checksum = compute_checksum(event, self.options.algorithm)?;
        let record = SequencedRecord {
            sequence_number,
            checksum,
            event: event.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let len = line.len() as u64;

        let must_rotate = state.file.is_none()
            || state.force_rotate
            || (state.size > 0 && state.size + len > self.options.rotation_size);
        if must_rotate {
            if let Err(e) = self.rotate(&mut state).await {
                state.write_failures += 1;
                state.force_rotate = true;
                return Err(e);
            }
        }

        let path = state.path.clone().unwrap_or_default();
        let result = match state.file.as_mut() {
            Some(file) => match file.write_all(line.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            },
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no active audit file",
            )),
        };

        if let Err(e) = result {
            state.write_failures += 1;
            state.force_rotate = true;
            return Err(AuditError::Persistence {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }

        state.size += len;
        state.event_count += 1;

        Ok(WriteReceipt {
            sequence_number,
            checksum: record.checksum,
            file: path,
        })
    }

    /// Flush and release the file handle. Later writes fail with `WriterClosed`.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tracing::info!(
            session = %self.session,
            events = state.event_count,
            "Audit writer closed"
        );
        Ok(())
    }

    /// Number of records written by this writer
    pub async fn event_count(&self) -> u64 {
        self.state.lock().await.event_count
    }

    /// Path of the file currently receiving records
    pub async fn current_file(&self) -> Option<PathBuf> {
        self.state.lock().await.path.clone()
    }

    /// All files created by this writer, oldest first
    pub async fn files(&self) -> Vec<PathBuf> {
        self.state.lock().await.files.clone()
    }

    pub async fn stats(&self) -> WriterStats {
        let state = self.state.lock().await;
        WriterStats {
            events_written: state.event_count,
            write_failures: state.write_failures,
            rotations: state.rotations,
            current_file: state.path.clone(),
            current_file_bytes: state.size,
            open: state.file.is_some() && !state.closed,
        }
    }

    /// Session identifier embedded in this writer's file names
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    async fn rotate(&self, state: &mut WriterState) -> Result<()> {
        let previous = state.path.clone();
        if let Some(mut file) = state.file.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!(error = %e, "Failed to flush audit file before rotation");
            }
        }
        if previous.is_some() {
            state.file_index += 1;
            state.rotations += 1;
        }
        self.open_next(state).await?;
        state.force_rotate = false;

        if let Some(previous) = previous {
            tracing::info!(
                from = %previous.display(),
                to = %state.path.as_deref().unwrap_or(Path::new("")).display(),
                next_sequence = state.event_count,
                "Audit log rotated"
            );
        }
        Ok(())
    }

    async fn open_next(&self, state: &mut WriterState) -> Result<()> {
        let path = self.options.dir.join(format!(
            "{}-{}-{:06}.jsonl",
            self.options.prefix, self.session, state.file_index
        ));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditError::Persistence {
                path: path.display().to_string(),
                reason: format!("failed to open: {}", e),
            })?;
        state.size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        state.file = Some(file);
        state.files.push(path.clone());
        state.path = Some(path);
        Ok(())
    }
}

/// Read every record from one log file.
///
/// Unparsable lines are an error; use [`verify_log`] to survey damage.
pub async fn read_log(path: &Path) -> Result<Vec<SequencedRecord>> {
    let file = fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Outcome of verifying one or more log files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub records_checked: u64,
    /// Sequence numbers whose checksum no longer matches the event
    pub checksum_mismatches: Vec<u64>,
    /// `(expected, found)` pairs where the sequence skipped or repeated
    pub sequence_gaps: Vec<(u64, u64)>,
    /// `(file, line number)` of lines that did not parse
    pub unparsable_lines: Vec<(PathBuf, usize)>,
}

impl VerificationReport {
    pub fn is_intact(&self) -> bool {
        self.checksum_mismatches.is_empty()
            && self.sequence_gaps.is_empty()
            && self.unparsable_lines.is_empty()
    }
}

/// Recompute checksums and check sequence continuity across files.
///
/// `paths` must be one writer session's files in order.
pub async fn verify_log(paths: &[PathBuf]) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();
    let mut expected: Option<u64> = None;

    for path in paths {
        let file = fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: SequencedRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => {
                    report.unparsable_lines.push((path.clone(), line_no));
                    continue;
                }
            };
            report.records_checked += 1;

            if let Some(exp) = expected {
                if record.sequence_number != exp {
                    report.sequence_gaps.push((exp, record.sequence_number));
                }
            }
            expected = Some(record.sequence_number + 1);

            if !verify_checksum(&record.event, &record.checksum).unwrap_or(false) {
                report.checksum_mismatches.push(record.sequence_number);
            }
        }
    }

    Ok(report)
}
