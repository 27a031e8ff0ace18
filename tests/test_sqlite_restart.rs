//! Restart tests over the SQLite task store
//!
//! A runtime imports and dispatches a trace into a database file, shuts
//! down, and a second runtime opened on the same file picks the tasks up.

mod test_helpers;

use qa_pipeline::cache::MemoryTraceCache;
use qa_pipeline::importer::ImportRequest;
use qa_pipeline::model::{AnnotationInput, Category, QualityLabel, TaskStatus};
use qa_pipeline::mq::memory::MemoryQueue;
use qa_pipeline::processors::PassthroughQuality;
use qa_pipeline::runtime::{PipelineParts, PipelineRuntime};
use qa_pipeline::store::sqlite::SqliteTaskStore;
use qa_pipeline::store::{PageRequest, TaskStore, UnitFilter};
use qa_pipeline::testing::mocks::MockKnowledgeSink;
use qa_pipeline::trace::memory::MemoryTraceStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{call_record, root_record, test_config, wait_for, window};

async fn runtime_on(path: &Path) -> (PipelineRuntime, Arc<dyn TaskStore>) {
    let config = test_config();
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(path).await.unwrap());
    let traces = MemoryTraceStore::with_records(
        vec![root_record("t1", 1)],
        vec![
            call_record("t1", "writer", Category::Agent, 2),
            call_record("t1", "search", Category::Tool, 3),
        ],
    );
    let parts = PipelineParts {
        queue: Arc::new(MemoryQueue::new(config.mq.clone())),
        store: store.clone(),
        cache: Arc::new(MemoryTraceCache::new(Duration::from_secs(60), 1000)),
        enricher: Arc::new(PassthroughQuality),
        sink: Arc::new(MockKnowledgeSink::new()),
        traces: Some(Arc::new(traces)),
    };
    (PipelineRuntime::new(config, parts), store)
}

fn request(runtime: &PipelineRuntime) -> ImportRequest {
    let mut request = ImportRequest::new(window(), &runtime.config().importer);
    request.include_tool_calls = true;
    request
}

#[tokio::test]
async fn test_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let (mut first, store) = runtime_on(&path).await;
    first.start().await.unwrap();
    let result = first.importer().unwrap().execute(&request(&first)).await.unwrap();
    assert_eq!(result.imported, 3);

    let dispatched = wait_for(|| {
        let store = store.clone();
        async move {
            let units = store
                .list_units(&UnitFilter::with_status(TaskStatus::Assigned), &PageRequest::default())
                .await
                .unwrap();
            units.total == 3
        }
    })
    .await;
    assert!(dispatched, "units should be stored and assigned");

    let root = store
        .list_units(
            &UnitFilter {
                only_roots: true,
                ..UnitFilter::default()
            },
            &PageRequest::default(),
        )
        .await
        .unwrap()
        .items
        .remove(0);
    first
        .service()
        .annotate(
            &root.data_id,
            AnnotationInput::labelled("alice", QualityLabel::Good),
        )
        .await
        .unwrap();
    first.shutdown().await.unwrap();
    drop(first);
    drop(store);

    let (mut second, store) = runtime_on(&path).await;
    second.start().await.unwrap();

    let all = store
        .list_units(&UnitFilter::default(), &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(all.total, 3);
    let reloaded = store.get_unit(&root.data_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Annotated);
    assert_eq!(
        reloaded.status_path(),
        vec![TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Annotated]
    );
    let annotation = store
        .latest_annotation_for(&root.data_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(annotation.input.quality_label, QualityLabel::Good);

    // Stored hashes keep a fresh process from importing the same trace twice
    let again = second.importer().unwrap().execute(&request(&second)).await.unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped, 3);

    let approved = second
        .service()
        .approve(&root.data_id, "reviewer-1", None, false)
        .await
        .unwrap();
    assert_eq!(approved.status, TaskStatus::Approved);
    second.shutdown().await.unwrap();
}
