//! Time-windowed batch import from the trace log
//!
//! An import walks the root records in a window (newest first), publishes an
//! end-to-end unit for each, then the completed sub-calls of that trace as its
//! children. Remaining standalone calls of the selected categories are
//! imported last, linked to a cached root when one is known.
//!
//! Re-running an overlapping window is safe: a unit whose content hash is
//! already stored, cached or published earlier in the same run is skipped.

use crate::cache::{hash_key, TraceCache};
use crate::config::{ContentRules, ImporterSection};
use crate::error::PipelineError;
use crate::model::{Category, QAUnit, UnitDraft};
use crate::mq::{MessageQueue, Topic};
use crate::observability::metrics::metrics;
use crate::store::TaskStore;
use crate::trace::{CallRecord, RecordCounts, TimeWindow, TraceStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// What to import from a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub window: TimeWindow,
    pub include_roots: bool,
    pub include_agent_calls: bool,
    pub include_tool_calls: bool,
    /// Import each root's sub-calls as its children
    pub include_sub_nodes: bool,
    /// Cap on units published, shared by roots and calls
    pub limit: usize,
}

impl ImportRequest {
    /// Request with the configured defaults
    pub fn new(window: TimeWindow, config: &ImporterSection) -> Self {
        Self {
            window,
            include_roots: true,
            include_agent_calls: config.include_agent_calls,
            include_tool_calls: config.include_tool_calls,
            include_sub_nodes: config.include_sub_nodes,
            limit: config.default_limit,
        }
    }

    fn standalone_categories(&self) -> Vec<Category> {
        let mut categories = Vec::new();
        if self.include_agent_calls {
            categories.push(Category::Agent);
        }
        if self.include_tool_calls {
            categories.push(Category::Tool);
        }
        categories
    }
}

/// Record counts an import of the same request would scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportPreview {
    #[serde(flatten)]
    pub counts: RecordCounts,
    pub estimated_total: usize,
}

/// Outcome of one import run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportResult {
    pub batch_id: String,
    pub imported: usize,
    /// Duplicates and records failing content rules
    pub skipped: usize,
    /// Publish failures and failed per-trace queries
    pub errors: usize,
    pub roots_imported: usize,
    pub calls_imported: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Mutable bookkeeping for one run
struct ImportRun {
    batch_id: String,
    remaining: usize,
    /// content_hash -> data_id for units published in this run
    published: HashMap<String, String>,
    processed_traces: HashSet<String>,
    result: ImportResult,
}

impl ImportRun {
    fn new(limit: usize) -> Self {
        let batch_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            batch_id: batch_id.clone(),
            remaining: limit,
            published: HashMap::new(),
            processed_traces: HashSet::new(),
            result: ImportResult {
                batch_id,
                imported: 0,
                skipped: 0,
                errors: 0,
                roots_imported: 0,
                calls_imported: 0,
                started_at: now,
                finished_at: now,
            },
        }
    }
}

/// Where a draft stands before publishing
enum Admission {
    New,
    /// Already imported; carries the existing `data_id` when it is known
    Known(Option<String>),
    Invalid(PipelineError),
}

/// Batch importer from a [`TraceStore`] onto the `raw` topic
pub struct Importer {
    traces: Arc<dyn TraceStore>,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn MessageQueue>,
    cache: Arc<dyn TraceCache>,
    rules: ContentRules,
}

impl Importer {
    pub fn new(
        traces: Arc<dyn TraceStore>,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn MessageQueue>,
        cache: Arc<dyn TraceCache>,
        rules: ContentRules,
    ) -> Self {
        Self {
            traces,
            store,
            queue,
            cache,
            rules,
        }
    }

    /// Count the records a request would scan; nothing is published
    pub async fn preview(&self, request: &ImportRequest) -> Result<ImportPreview, PipelineError> {
        let window = &request.window;
        let mut counts = RecordCounts::default();

        if request.include_roots {
            counts.roots = self
                .traces
                .count_roots(window)
                .await
                .map_err(|e| PipelineError::import(format!("root count failed: {e}")))?;
        }
        if request.include_agent_calls {
            counts.agent_calls = self
                .traces
                .count_calls(window, &[Category::Agent])
                .await
                .map_err(|e| PipelineError::import(format!("agent call count failed: {e}")))?;
        }
        if request.include_tool_calls {
            counts.tool_calls = self
                .traces
                .count_calls(window, &[Category::Tool])
                .await
                .map_err(|e| PipelineError::import(format!("tool call count failed: {e}")))?;
        }

        let estimated_total = counts.roots + counts.agent_calls + counts.tool_calls;
        Ok(ImportPreview {
            counts,
            estimated_total,
        })
    }

    /// Earliest and latest record time available for import
    pub async fn available_range(&self) -> Result<Option<TimeWindow>, PipelineError> {
        self.traces.available_range().await
    }

    /// Run an import. Only an unavailable root query aborts the run; every
    /// other failure is counted in the result.
    pub async fn execute(&self, request: &ImportRequest) -> Result<ImportResult, PipelineError> {
        let mut run = ImportRun::new(request.limit);
        let span = crate::import_span!(
            batch_id = %run.batch_id,
            start = %request.window.start,
            end = %request.window.end
        );

        async {
            info!(limit = request.limit, "Import started");

            if request.include_roots {
                self.import_roots(request, &mut run).await?;
            }

            let categories = request.standalone_categories();
            if !categories.is_empty() && run.remaining > 0 {
                self.import_standalone(request, &categories, &mut run).await;
            }

            run.result.finished_at = Utc::now();
            let result = run.result;
            metrics().units_imported(result.imported as u64);
            metrics().units_skipped(result.skipped as u64);
            metrics().import_errors(result.errors as u64);
            info!(
                imported = result.imported,
                skipped = result.skipped,
                errors = result.errors,
                roots = result.roots_imported,
                calls = result.calls_imported,
                "Import finished"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }

    async fn import_roots(
        &self,
        request: &ImportRequest,
        run: &mut ImportRun,
    ) -> Result<(), PipelineError> {
        let roots = self
            .traces
            .query_roots(&request.window, request.limit)
            .await
            .map_err(|e| PipelineError::import(format!("root query failed: {e}")))?;
        debug!(count = roots.len(), "Root records selected");

        for root in roots {
            if run.remaining == 0 {
                break;
            }
            let draft = root.to_draft(Some(&run.batch_id));

            // An invalid root still has its sub-calls imported, without a parent
            let root_id = match self.admit(&draft, run).await {
                Admission::Invalid(e) => {
                    debug!(trace_id = %root.trace_id, error = %e, "Skipping root record");
                    run.result.skipped += 1;
                    None
                }
                Admission::Known(existing) => {
                    run.result.skipped += 1;
                    existing
                }
                Admission::New => {
                    let unit = draft.into_root_unit();
                    match self.publish(&unit, run).await {
                        Some(id) => {
                            run.result.roots_imported += 1;
                            Some(id)
                        }
                        None => continue,
                    }
                }
            };

            if let Some(root_id) = &root_id {
                self.cache.remember_root(&root.trace_id, root_id);
            }
            run.processed_traces.insert(root.trace_id.clone());

            if request.include_sub_nodes {
                self.import_sub_calls(&root.trace_id, root_id, run).await;
            }
        }
        Ok(())
    }

    async fn import_sub_calls(&self, trace_id: &str, root_id: Option<String>, run: &mut ImportRun) {
        let calls = match self.traces.query_calls_for_trace(trace_id).await {
            Ok(calls) => calls,
            Err(e) => {
                warn!(trace_id = trace_id, error = %e, "Sub-call query failed");
                run.result.errors += 1;
                return;
            }
        };

        for call in calls
            .iter()
            .filter(|c| c.is_completed() && !c.is_user_call())
        {
            if run.remaining == 0 {
                break;
            }
            self.import_call(call, root_id.clone(), run).await;
        }
    }

    async fn import_standalone(
        &self,
        request: &ImportRequest,
        categories: &[Category],
        run: &mut ImportRun,
    ) {
        let calls = match self
            .traces
            .query_calls(&request.window, categories, run.remaining)
            .await
        {
            Ok(calls) => calls,
            Err(e) => {
                warn!(error = %e, "Standalone call query failed");
                run.result.errors += 1;
                return;
            }
        };

        for call in calls
            .iter()
            .filter(|c| !run.processed_traces.contains(&c.trace_id))
            .collect::<Vec<_>>()
        {
            if run.remaining == 0 {
                break;
            }
            let parent = self.cache.root_for_trace(&call.trace_id);
            self.import_call(call, parent, run).await;
        }
    }

    async fn import_call(&self, call: &CallRecord, parent: Option<String>, run: &mut ImportRun) {
        let draft = call.to_draft(Some(&run.batch_id), parent);
        match self.admit(&draft, run).await {
            Admission::Invalid(e) => {
                debug!(
                    trace_id = %call.trace_id,
                    callee = %call.callee,
                    error = %e,
                    "Skipping call record"
                );
                run.result.skipped += 1;
            }
            Admission::Known(_) => run.result.skipped += 1,
            Admission::New => {
                let unit = draft.into_unit();
                if let Some(id) = self.publish(&unit, run).await {
                    if unit.is_root() {
                        self.cache.remember_root(&unit.source_trace_id, &id);
                    }
                    run.result.calls_imported += 1;
                }
            }
        }
    }

    /// Validate content and look the hash up in this run, the store and the cache
    async fn admit(&self, draft: &UnitDraft, run: &ImportRun) -> Admission {
        if let Err(e) = self.rules.check(&draft.question, &draft.answer) {
            return Admission::Invalid(e);
        }

        let hash = draft.content_hash();
        if let Some(id) = run.published.get(&hash) {
            return Admission::Known(Some(id.clone()));
        }
        match self.store.find_by_hash(&hash).await {
            Ok(Some(unit)) => return Admission::Known(Some(unit.data_id)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Task store lookup failed, falling back to cache"),
        }
        if let Some(id) = self.cache.get(&hash_key(&hash)) {
            return Admission::Known(Some(id));
        }
        Admission::New
    }

    /// Publish a unit to `raw`; returns its id, or `None` after counting an error
    async fn publish(&self, unit: &QAUnit, run: &mut ImportRun) -> Option<String> {
        let payload = match serde_json::to_value(unit) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(data_id = %unit.data_id, error = %e, "Unit serialization failed");
                run.result.errors += 1;
                return None;
            }
        };

        match self
            .queue
            .publish(Topic::Raw, payload, unit.priority.value(), None)
            .await
        {
            Ok(_) => {
                self.cache.remember_hash(&unit.content_hash, &unit.data_id);
                run.published
                    .insert(unit.content_hash.clone(), unit.data_id.clone());
                run.remaining = run.remaining.saturating_sub(1);
                run.result.imported += 1;
                Some(unit.data_id.clone())
            }
            Err(e) => {
                warn!(data_id = %unit.data_id, error = %e, "Publishing unit failed");
                run.result.errors += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTraceCache;
    use crate::config::MqSection;
    use crate::mq::memory::MemoryQueue;
    use crate::store::memory::MemoryTaskStore;
    use crate::testing::mocks::FailingTraceStore;
    use crate::trace::memory::MemoryTraceStore;
    use crate::trace::{CallState, RootRecord};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, minute, 0).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(at(0), at(0) + Duration::hours(1)).unwrap()
    }

    fn root(trace: &str, minute: u32) -> RootRecord {
        RootRecord {
            trace_id: trace.to_string(),
            request_id: format!("{trace}-root"),
            group_id: "session".to_string(),
            callee: "master_agent".to_string(),
            input: json!({"query": format!("question for {trace}")}),
            output: json!(format!("final answer for {trace}")),
            created_at: at(minute),
        }
    }

    fn call(trace: &str, caller: &str, callee: &str, category: Category, minute: u32) -> CallRecord {
        CallRecord {
            trace_id: trace.to_string(),
            request_id: format!("{trace}-{callee}"),
            node_id: None,
            group_id: "session".to_string(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            caller_category: None,
            callee_category: category,
            call_stack: vec!["user".into(), "master_agent".into(), callee.into()],
            input: json!({"arguments": {"query": format!("{callee} query")}}),
            output: json!(format!("{callee} produced a result")),
            state: CallState::Completed,
            created_at: at(minute),
        }
    }

    async fn importer(traces: Arc<dyn TraceStore>) -> (Importer, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new(MqSection::default()));
        queue.connect().await.unwrap();
        let importer = Importer::new(
            traces,
            Arc::new(MemoryTaskStore::new()),
            queue.clone(),
            Arc::new(MemoryTraceCache::new(StdDuration::from_secs(60), 100)),
            ContentRules::default(),
        );
        (importer, queue)
    }

    fn request() -> ImportRequest {
        ImportRequest {
            window: window(),
            include_roots: true,
            include_agent_calls: true,
            include_tool_calls: false,
            include_sub_nodes: true,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_preview_counts_only() {
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![root("t1", 1), root("t2", 2)],
            vec![
                call("t1", "master_agent", "writer", Category::Agent, 3),
                call("t1", "master_agent", "search", Category::Tool, 4),
            ],
        ));
        let (importer, queue) = importer(traces).await;

        let mut req = request();
        req.include_tool_calls = true;
        let preview = importer.preview(&req).await.unwrap();
        assert_eq!(preview.counts.roots, 2);
        assert_eq!(preview.counts.agent_calls, 1);
        assert_eq!(preview.counts.tool_calls, 1);
        assert_eq!(preview.estimated_total, 4);
        assert!(queue.retained(Topic::Raw).is_empty());
    }

    #[tokio::test]
    async fn test_children_link_to_root() {
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![root("t1", 1)],
            vec![
                call("t1", "user", "master_agent", Category::Agent, 1),
                call("t1", "master_agent", "writer", Category::Agent, 2),
                call("t1", "master_agent", "search", Category::Tool, 3),
            ],
        ));
        let (importer, queue) = importer(traces).await;

        let result = importer.execute(&request()).await.unwrap();
        assert_eq!(result.imported, 3);
        assert_eq!(result.roots_imported, 1);
        assert_eq!(result.calls_imported, 2);

        let units: Vec<QAUnit> = queue
            .retained(Topic::Raw)
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        let root = units.iter().find(|u| u.is_root()).unwrap();
        for child in units.iter().filter(|u| !u.is_root()) {
            assert_eq!(child.parent_id.as_deref(), Some(root.data_id.as_str()));
            assert_eq!(child.batch_id.as_deref(), Some(result.batch_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_repeat_import_skips_everything() {
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![root("t1", 1)],
            vec![
                call("t1", "master_agent", "writer", Category::Agent, 2),
                call("t1", "master_agent", "search", Category::Tool, 3),
            ],
        ));
        let (importer, _queue) = importer(traces).await;

        assert_eq!(importer.execute(&request()).await.unwrap().imported, 3);
        let second = importer.execute(&request()).await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped, 3);
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped() {
        let mut short = root("t2", 2);
        short.output = json!("");
        let traces = Arc::new(MemoryTraceStore::with_records(vec![root("t1", 1), short], vec![]));
        let (importer, _queue) = importer(traces).await;

        let result = importer.execute(&request()).await.unwrap();
        assert_eq!(result.imported, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.errors, 0);
    }

    #[tokio::test]
    async fn test_short_root_answer_keeps_children() {
        let mut clock = root("t1", 1);
        clock.input = json!({"query": "What time is it?"});
        clock.output = json!("16:53");
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![clock],
            vec![
                call("t1", "master_agent", "time_agent", Category::Agent, 2),
                call("t1", "time_agent", "clock_tool", Category::Tool, 3),
            ],
        ));
        let (importer, queue) = importer(traces).await;

        let result = importer.execute(&request()).await.unwrap();
        assert_eq!(result.imported, 3);
        assert_eq!(result.roots_imported, 1);
        assert_eq!(result.calls_imported, 2);

        let units: Vec<QAUnit> = queue
            .retained(Topic::Raw)
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        let root = units.iter().find(|u| u.is_root()).unwrap();
        assert_eq!(root.answer, "16:53");
        let children: Vec<_> = units.iter().filter(|u| !u.is_root()).collect();
        assert_eq!(children.len(), 2);
        for child in children {
            assert_eq!(child.parent_id.as_deref(), Some(root.data_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_invalid_root_orphans_children() {
        let mut empty = root("t1", 1);
        empty.output = json!("");
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![empty],
            vec![
                call("t1", "master_agent", "writer", Category::Agent, 2),
                call("t1", "master_agent", "search", Category::Tool, 3),
            ],
        ));
        let (importer, queue) = importer(traces).await;

        let result = importer.execute(&request()).await.unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(result.roots_imported, 0);
        // the tool call arrives through the root's sub-calls, not the standalone scan
        assert_eq!(result.calls_imported, 2);

        let units: Vec<QAUnit> = queue
            .retained(Topic::Raw)
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        assert!(units.iter().all(|u| u.parent_id.is_none()));
    }

    #[tokio::test]
    async fn test_standalone_calls_use_cached_parent() {
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![],
            vec![call("t9", "master_agent", "writer", Category::Agent, 5)],
        ));
        let (importer, queue) = importer(traces).await;
        importer.cache.remember_root("t9", "root-from-realtime");

        let result = importer.execute(&request()).await.unwrap();
        assert_eq!(result.calls_imported, 1);
        let unit: QAUnit = queue.retained(Topic::Raw)[0].decode().unwrap();
        assert_eq!(unit.parent_id.as_deref(), Some("root-from-realtime"));
    }

    #[tokio::test]
    async fn test_limit_is_shared() {
        let traces = Arc::new(MemoryTraceStore::with_records(
            vec![root("t1", 1), root("t2", 2)],
            vec![call("t1", "master_agent", "writer", Category::Agent, 3)],
        ));
        let (importer, _queue) = importer(traces).await;

        let mut req = request();
        req.limit = 2;
        let result = importer.execute(&req).await.unwrap();
        assert_eq!(result.imported, 2);
    }

    #[tokio::test]
    async fn test_root_query_failure_aborts() {
        let (importer, _queue) = importer(Arc::new(FailingTraceStore::new())).await;
        assert!(matches!(
            importer.execute(&request()).await,
            Err(PipelineError::Import { .. })
        ));
        assert!(importer.preview(&request()).await.is_err());
    }
}
