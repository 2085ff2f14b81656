use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::entry::AuditEntry;

/// Errors that can occur during audit log I/O.
#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create parent directories: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to open audit log file: {0}")]
    OpenFile(std::io::Error),

    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to audit log: {0}")]
    Write(std::io::Error),

    #[error("failed to flush audit log: {0}")]
    Flush(std::io::Error),

    #[error("failed to read audit log: {0}")]
    Read(std::io::Error),
}

/// Append-only file writer that serialises [`AuditEntry`] values as JSON-lines.
pub struct AuditWriter {
    file: tokio::fs::File,
}

impl AuditWriter {
    /// Open (or create) the audit log file at `path` in append mode.
    ///
    /// Parent directories are created automatically if they do not exist.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(AuditWriteError::CreateDir)?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(AuditWriteError::OpenFile)?;

        Ok(Self { file })
    }

    /// Serialise `entry` as a single JSON line and append it to the file.
    pub async fn write(&mut self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(AuditWriteError::Write)
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.file.flush().await.map_err(AuditWriteError::Flush)
    }
}

/// Read an audit log back into memory, skipping blank lines.
///
/// A malformed line is an error rather than silently skipped: a tampered or
/// truncated audit trail should be visible.
pub async fn read_entries(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, AuditWriteError> {
    let file = tokio::fs::File::open(path.as_ref())
        .await
        .map_err(AuditWriteError::Read)?;
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();

    while let Some(line) = lines.next_line().await.map_err(AuditWriteError::Read)? {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditEventType, AuditSource};

    #[tokio::test]
    async fn appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        for n in 0..2 {
            let mut writer = AuditWriter::new(&path).await.unwrap();
            writer
                .write(&AuditEntry::new(
                    AuditEventType::ThreatReported,
                    AuditSource::new("test"),
                    serde_json::json!({ "n": n }),
                ))
                .await
                .unwrap();
            writer.flush().await.unwrap();
        }

        let entries = read_entries(&path).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].details["n"], 1);
    }

    #[tokio::test]
    async fn malformed_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        tokio::fs::write(&path, b"{not json}\n").await.unwrap();

        let err = read_entries(&path).await.unwrap_err();
        assert!(matches!(err, AuditWriteError::Serialize(_)));
    }
}
