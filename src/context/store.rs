//! Append-only JSONL store, one file per lane.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ContextError, ContextMessageRecord};
use crate::util::sanitize_filename;

/// Bytes a record occupies in its lane file, trailing newline included.
///
/// Falls back to the content length if the record cannot be encoded.
pub(crate) fn record_bytes(record: &ContextMessageRecord) -> usize {
    serde_json::to_string(record)
        .map(|line| line.len())
        .unwrap_or_else(|_| record.content.len())
        + 1
}

/// Durable lane storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct ContextStore {
    root: PathBuf,
}

impl ContextStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `lane_id`.
    pub fn lane_path(&self, lane_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.jsonl", sanitize_filename(lane_id)))
    }

    /// Read every record of a lane. Missing files yield an empty lane and
    /// malformed lines are skipped.
    pub async fn load(&self, lane_id: &str) -> Result<Vec<ContextMessageRecord>, ContextError> {
        let path = self.lane_path(lane_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ContextError::io(path, err)),
        };

        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ContextMessageRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed record {} in {}: {}",
                        idx + 1,
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(records)
    }

    /// Append records to the end of a lane file.
    pub async fn append(
        &self,
        lane_id: &str,
        records: &[ContextMessageRecord],
    ) -> Result<(), ContextError> {
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_root().await?;
        let path = self.lane_path(lane_id);
        let data = encode(records)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ContextError::io(&path, e))?;
        file.write_all(data.as_bytes())
            .await
            .map_err(|e| ContextError::io(&path, e))?;
        file.flush().await.map_err(|e| ContextError::io(&path, e))?;
        Ok(())
    }

    /// Replace the whole lane file.
    pub async fn write_all(
        &self,
        lane_id: &str,
        records: &[ContextMessageRecord],
    ) -> Result<(), ContextError> {
        self.ensure_root().await?;
        let path = self.lane_path(lane_id);
        let data = encode(records)?;
        let tmp_path = path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| ContextError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| ContextError::io(&path, e))?;
        Ok(())
    }

    /// Keep only the newest `keep_last` records. Returns how many were dropped.
    pub async fn truncate(&self, lane_id: &str, keep_last: usize) -> Result<usize, ContextError> {
        let records = self.load(lane_id).await?;
        if records.len() <= keep_last {
            return Ok(0);
        }
        let dropped = records.len() - keep_last;
        self.write_all(lane_id, &records[dropped..]).await?;
        Ok(dropped)
    }

    async fn ensure_root(&self) -> Result<(), ContextError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ContextError::io(&self.root, e))
    }
}

fn encode(records: &[ContextMessageRecord]) -> Result<String, ContextError> {
    let mut data = String::new();
    for record in records {
        data.push_str(&serde_json::to_string(record)?);
        data.push('\n');
    }
    Ok(data)
}
