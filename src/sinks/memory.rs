//! In-process sink for tests and dry runs.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use crate::ledger::RecordView;
use crate::sinks::{ArchiveSink, ExportSink, SinkError};
use crate::subject::ExportBundle;

#[derive(Default)]
pub struct MemorySink {
    archived: Mutex<Vec<RecordView>>,
    exports: Mutex<Vec<ExportBundle>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Vec<RecordView> {
        self.archived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn exports(&self) -> Vec<ExportBundle> {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ArchiveSink for MemorySink {
    async fn archive(&self, view: &RecordView) -> Result<String, SinkError> {
        self.archived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(view.clone());
        Ok(format!("memory://archive/{}", view.sequence))
    }
}

#[async_trait]
impl ExportSink for MemorySink {
    async fn write_export(&self, bundle: &ExportBundle) -> Result<String, SinkError> {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bundle.clone());
        Ok(format!("memory://export/{}", bundle.request_id))
    }
}
