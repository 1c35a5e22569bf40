//! Directory-backed sink: one JSON document per write.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::ledger::RecordView;
use crate::sinks::{ArchiveSink, ExportSink, SinkError};
use crate::subject::ExportBundle;

#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_json<T: Serialize>(&self, name: &str, item: &T) -> Result<String, SinkError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SinkError::Unavailable(format!("{}: {}", self.dir.display(), e)))?;

        let body = serde_json::to_vec_pretty(item)
            .map_err(|e| SinkError::Rejected(format!("serialization failed: {}", e)))?;

        // Write under a temporary name so readers never see partial documents
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{}.tmp", name));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| SinkError::Io(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SinkError::Io(format!("{}: {}", path.display(), e)))?;

        debug!("Wrote {} bytes to {}", body.len(), path.display());
        Ok(path.to_string_lossy().to_string())
    }
}

#[async_trait]
impl ArchiveSink for FileSink {
    async fn archive(&self, view: &RecordView) -> Result<String, SinkError> {
        self.write_json(&format!("record-{:012}.json", view.sequence), view)
            .await
    }
}

#[async_trait]
impl ExportSink for FileSink {
    async fn write_export(&self, bundle: &ExportBundle) -> Result<String, SinkError> {
        self.write_json(&format!("export-{}.json", bundle.request_id), bundle)
            .await
    }
}
