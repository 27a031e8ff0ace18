//! JSON-lines trace store for offline imports
//!
//! Reads `roots.jsonl` and `calls.jsonl` from one directory, one record per
//! line. Blank lines are ignored; malformed lines are logged and skipped.

use super::memory::MemoryTraceStore;
use super::{CallRecord, RootRecord, TimeWindow, TraceStore};
use crate::error::PipelineError;
use crate::model::Category;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ROOTS_FILE: &str = "roots.jsonl";
pub const CALLS_FILE: &str = "calls.jsonl";

/// Trace store loaded from a directory of JSON-lines files
#[derive(Debug)]
pub struct JsonlTraceStore {
    dir: PathBuf,
    records: MemoryTraceStore,
    skipped_lines: usize,
}

impl JsonlTraceStore {
    /// Load both files; a missing file is treated as empty
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let dir = dir.as_ref().to_path_buf();
        let (roots, skipped_roots) = read_records::<RootRecord>(&dir.join(ROOTS_FILE)).await?;
        let (calls, skipped_calls) = read_records::<CallRecord>(&dir.join(CALLS_FILE)).await?;

        info!(
            dir = %dir.display(),
            roots = roots.len(),
            calls = calls.len(),
            skipped = skipped_roots + skipped_calls,
            "Loaded trace files"
        );

        Ok(Self {
            dir,
            records: MemoryTraceStore::with_records(roots, calls),
            skipped_lines: skipped_roots + skipped_calls,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lines that failed to parse during load
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }
}

async fn read_records<T: DeserializeOwned>(
    path: &Path,
) -> Result<(Vec<T>, usize), PipelineError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Trace file not found, treating as empty");
            return Ok((Vec::new(), 0));
        }
        Err(e) => {
            return Err(PipelineError::transient(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    let mut records = Vec::new();
    let mut skipped = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed trace record"
                );
            }
        }
    }
    Ok((records, skipped))
}

#[async_trait::async_trait]
impl TraceStore for JsonlTraceStore {
    async fn count_roots(&self, window: &TimeWindow) -> Result<usize, PipelineError> {
        self.records.count_roots(window).await
    }

    async fn count_calls(
        &self,
        window: &TimeWindow,
        categories: &[Category],
    ) -> Result<usize, PipelineError> {
        self.records.count_calls(window, categories).await
    }

    async fn query_roots(
        &self,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<RootRecord>, PipelineError> {
        self.records.query_roots(window, limit).await
    }

    async fn query_calls_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Vec<CallRecord>, PipelineError> {
        self.records.query_calls_for_trace(trace_id).await
    }

    async fn query_calls(
        &self,
        window: &TimeWindow,
        categories: &[Category],
        limit: usize,
    ) -> Result<Vec<CallRecord>, PipelineError> {
        self.records.query_calls(window, categories, limit).await
    }

    async fn available_range(&self) -> Result<Option<TimeWindow>, PipelineError> {
        self.records.available_range().await
    }
}
