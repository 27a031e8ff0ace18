//! In-memory trace store

use super::{CallRecord, RootRecord, TimeWindow, TraceStore};
use crate::error::PipelineError;
use crate::model::Category;
use tokio::sync::RwLock;

/// Trace store over records held in memory
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    roots: RwLock<Vec<RootRecord>>,
    calls: RwLock<Vec<CallRecord>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(roots: Vec<RootRecord>, calls: Vec<CallRecord>) -> Self {
        Self {
            roots: RwLock::new(roots),
            calls: RwLock::new(calls),
        }
    }

    pub async fn add_root(&self, record: RootRecord) {
        self.roots.write().await.push(record);
    }

    pub async fn add_call(&self, record: CallRecord) {
        self.calls.write().await.push(record);
    }
}

fn matches_call(record: &CallRecord, window: &TimeWindow, categories: &[Category]) -> bool {
    record.is_completed()
        && window.contains(record.created_at)
        && categories.contains(&record.callee_category)
}

#[async_trait::async_trait]
impl TraceStore for MemoryTraceStore {
    async fn count_roots(&self, window: &TimeWindow) -> Result<usize, PipelineError> {
        let roots = self.roots.read().await;
        Ok(roots.iter().filter(|r| window.contains(r.created_at)).count())
    }

    async fn count_calls(
        &self,
        window: &TimeWindow,
        categories: &[Category],
    ) -> Result<usize, PipelineError> {
        let calls = self.calls.read().await;
        Ok(calls
            .iter()
            .filter(|c| matches_call(c, window, categories))
            .count())
    }

    async fn query_roots(
        &self,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<RootRecord>, PipelineError> {
        let roots = self.roots.read().await;
        let mut selected: Vec<RootRecord> = roots
            .iter()
            .filter(|r| window.contains(r.created_at))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected.truncate(limit);
        Ok(selected)
    }

    async fn query_calls_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Vec<CallRecord>, PipelineError> {
        let calls = self.calls.read().await;
        let mut selected: Vec<CallRecord> = calls
            .iter()
            .filter(|c| c.trace_id == trace_id)
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(selected)
    }

    async fn query_calls(
        &self,
        window: &TimeWindow,
        categories: &[Category],
        limit: usize,
    ) -> Result<Vec<CallRecord>, PipelineError> {
        let calls = self.calls.read().await;
        let mut selected: Vec<CallRecord> = calls
            .iter()
            .filter(|c| matches_call(c, window, categories))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected.truncate(limit);
        Ok(selected)
    }

    async fn available_range(&self) -> Result<Option<TimeWindow>, PipelineError> {
        let roots = self.roots.read().await;
        let calls = self.calls.read().await;
        let times: Vec<_> = roots
            .iter()
            .map(|r| r.created_at)
            .chain(calls.iter().map(|c| c.created_at))
            .collect();
        match (times.iter().min(), times.iter().max()) {
            (Some(&start), Some(&end)) => Ok(Some(TimeWindow { start, end })),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CallState;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn root(trace_id: &str, minute: u32) -> RootRecord {
        RootRecord {
            trace_id: trace_id.to_string(),
            request_id: String::new(),
            group_id: String::new(),
            callee: "master".to_string(),
            input: json!({"query": "q"}),
            output: json!("a"),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        }
    }

    fn call(trace_id: &str, category: Category, state: CallState, minute: u32) -> CallRecord {
        CallRecord {
            trace_id: trace_id.to_string(),
            request_id: format!("{trace_id}-{minute}"),
            node_id: None,
            group_id: String::new(),
            caller: "master".to_string(),
            callee: "worker".to_string(),
            caller_category: None,
            callee_category: category,
            call_stack: vec![],
            input: json!({}),
            output: json!(""),
            state,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        }
    }

    fn window() -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        TimeWindow::new(start, start + Duration::minutes(30)).unwrap()
    }

    #[tokio::test]
    async fn test_roots_newest_first_with_limit() {
        let store = MemoryTraceStore::with_records(
            vec![root("a", 1), root("b", 5), root("c", 3), root("late", 45)],
            vec![],
        );
        assert_eq!(store.count_roots(&window()).await.unwrap(), 3);
        let roots = store.query_roots(&window(), 2).await.unwrap();
        let ids: Vec<_> = roots.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_calls_filtered_by_category_and_state() {
        let store = MemoryTraceStore::with_records(
            vec![],
            vec![
                call("t", Category::Agent, CallState::Completed, 1),
                call("t", Category::Tool, CallState::Completed, 2),
                call("t", Category::Agent, CallState::Failed, 3),
            ],
        );
        let agents = [Category::Agent];
        assert_eq!(store.count_calls(&window(), &agents).await.unwrap(), 1);
        let both = [Category::Agent, Category::Tool];
        assert_eq!(store.query_calls(&window(), &both, 10).await.unwrap().len(), 2);
        assert_eq!(store.query_calls_for_trace("t").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_available_range() {
        let store = MemoryTraceStore::new();
        assert!(store.available_range().await.unwrap().is_none());
        store.add_root(root("a", 7)).await;
        store
            .add_call(call("a", Category::Tool, CallState::Completed, 2))
            .await;
        let range = store.available_range().await.unwrap().unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 0).unwrap());
    }
}
