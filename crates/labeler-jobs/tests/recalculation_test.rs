//! End-to-end recalculation tests against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labeler_db::MemoryLabelStore;
use labeler_jobs::{
    DatasetLogEntry, DatasetPayload, DatasetSchema, EvaluatorConfig, EventBus, Extraction,
    Extractor, LabelCalculator, LabelChangedEvent, LabelDefinition, LabelEvent, LabelSelector,
    LabelStore, LabelTransaction, LabelValue, LogLevel, NewDatasetEvent, NoOpEvaluator,
    QuickJsEvaluator, RecalculationController, RecalculationTrigger, Result,
};
use serde_json::{json, Value as JsonValue};

const SCHEMA_ID: i32 = 10;

fn dataset(id: i32, data: JsonValue) -> DatasetPayload {
    DatasetPayload {
        id,
        test_id: 100,
        data,
        schemas: vec![DatasetSchema {
            schema_id: SCHEMA_ID,
            uri: "urn:example:run:1.0".to_string(),
            index: 0,
        }],
    }
}

fn label(id: i32, function: Option<&str>, extractors: &[(&str, &str, bool)]) -> LabelDefinition {
    LabelDefinition {
        id,
        name: format!("label{}", id),
        schema_id: SCHEMA_ID,
        function: function.map(String::from),
        extractors: extractors
            .iter()
            .map(|&(name, path, is_array)| Extractor::new(name, path, is_array))
            .collect(),
    }
}

fn new_dataset(dataset_id: i32) -> RecalculationTrigger {
    NewDatasetEvent {
        dataset_id,
        is_recalculation: false,
    }
    .into()
}

fn quickjs_controller<S: LabelStore>(store: S) -> RecalculationController<S> {
    RecalculationController::new(
        store,
        LabelCalculator::new(Arc::new(QuickJsEvaluator::default())),
        EventBus::new(64),
    )
}

#[tokio::test]
async fn test_function_over_aggregated_object() {
    let store = MemoryLabelStore::new();
    store
        .insert_dataset(dataset(1, json!([{"a": 1, "b": [2, 3]}])))
        .await;
    store
        .insert_label(label(
            1,
            Some("({a, b}) => a + b.length"),
            &[("a", "$.a", false), ("b", "$.b[*]", true)],
        ))
        .await;
    let controller = quickjs_controller(store.clone());
    let mut events = controller.events().subscribe();

    controller.run(new_dataset(1)).await.unwrap();

    assert_eq!(store.label_value(1, 1).await.unwrap().value, json!(3));
    let envelope = events.try_recv().unwrap();
    assert_eq!(
        envelope.payload,
        LabelEvent::LabelsUpdated {
            dataset_id: 1,
            is_recalculation: false
        }
    );
    assert_eq!(envelope.entity_id, "1");
}

#[tokio::test]
async fn test_aggregation_follows_extractor_count() {
    let store = MemoryLabelStore::new();
    store
        .insert_dataset(dataset(1, json!({"a": 1, "b": [2, 3]})))
        .await;
    store.insert_label(label(1, None, &[])).await;
    store.insert_label(label(2, None, &[("a", "$.a", false)])).await;
    store
        .insert_label(label(3, None, &[("a", "$.a", false), ("b", "$.b[*]", true)]))
        .await;
    store.insert_label(label(4, None, &[("x", "$.x", false)])).await;
    store.insert_label(label(5, None, &[("x", "$.x[*]", true)])).await;

    quickjs_controller(store.clone())
        .run(new_dataset(1))
        .await
        .unwrap();

    let values: Vec<(i32, JsonValue)> = store
        .label_values(1)
        .await
        .into_iter()
        .map(|v| (v.label_id, v.value))
        .collect();
    assert_eq!(
        values,
        vec![
            (1, json!({})),
            (2, json!(1)),
            (3, json!({"a": 1, "b": [2, 3]})),
            (4, JsonValue::Null),
            (5, json!([])),
        ]
    );
}

#[tokio::test]
async fn test_dataset_without_labels_still_publishes() {
    let store = MemoryLabelStore::new();
    store
        .insert_dataset(DatasetPayload {
            id: 7,
            test_id: 1,
            data: json!({"a": 1}),
            schemas: vec![],
        })
        .await;
    let controller = quickjs_controller(store.clone());
    let mut events = controller.events().subscribe();

    let report = controller.run(new_dataset(7)).await.unwrap();

    assert_eq!(report.resolved, 0);
    assert!(store.label_values(7).await.is_empty());
    assert_eq!(store.commit_count().await, 1);
    assert_eq!(events.try_recv().unwrap().payload.dataset_id(), 7);
}

#[tokio::test]
async fn test_throwing_function_only_affects_its_label() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 2}))).await;
    store
        .insert_label(label(1, Some("a => a * 10"), &[("a", "$.a", false)]))
        .await;
    store
        .insert_label(label(
            2,
            Some("a => { throw new Error('broken label') }"),
            &[("a", "$.a", false)],
        ))
        .await;
    store.insert_label(label(3, None, &[("a", "$.a", false)])).await;
    let controller = quickjs_controller(store.clone());
    let mut events = controller.events().subscribe();

    let report = controller.run(new_dataset(1)).await.unwrap();

    assert_eq!(report.failed, vec![2]);
    assert_eq!(store.label_value(1, 1).await.unwrap().value, json!(20));
    assert!(store.label_value(1, 2).await.is_none());
    assert_eq!(store.label_value(1, 3).await.unwrap().value, json!(2));

    let errors: Vec<DatasetLogEntry> = store
        .dataset_logs(1)
        .await
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]
        .message
        .starts_with("Evaluation of label 'label2' failed: '"));
    assert!(errors[0].message.contains("broken label"));
    assert!(errors[0]
        .message
        .ends_with("Code: a => { throw new Error('broken label') }"));
    assert_eq!(errors[0].source, "labels");

    assert!(events.try_recv().is_ok());
}

#[tokio::test]
async fn test_timed_out_function_only_affects_its_label() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 2}))).await;
    store
        .insert_label(label(1, Some("a => a + 1"), &[("a", "$.a", false)]))
        .await;
    store
        .insert_label(label(
            2,
            Some("a => { while (true) {} }"),
            &[("a", "$.a", false)],
        ))
        .await;
    store.insert_label(label(3, None, &[("a", "$.a", false)])).await;
    let evaluator = QuickJsEvaluator::new(
        EvaluatorConfig::default().with_timeout(Duration::from_millis(100)),
    );
    let controller = RecalculationController::new(
        store.clone(),
        LabelCalculator::new(Arc::new(evaluator)),
        EventBus::new(64),
    );

    let report = controller.run(new_dataset(1)).await.unwrap();

    assert_eq!(report.persisted, vec![1, 3]);
    assert_eq!(report.failed, vec![2]);
    assert_eq!(store.label_value(1, 1).await.unwrap().value, json!(3));
    assert!(store.label_value(1, 2).await.is_none());
    assert_eq!(store.label_value(1, 3).await.unwrap().value, json!(2));

    let errors: Vec<DatasetLogEntry> = store
        .dataset_logs(1)
        .await
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]
        .message
        .contains("function exceeded timeout of 100ms"));
}

#[tokio::test]
async fn test_circular_result_only_affects_its_label() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 2}))).await;
    store
        .insert_label(label(
            1,
            Some("a => { const o = { a }; o.self = o; return o; }"),
            &[("a", "$.a", false)],
        ))
        .await;
    store
        .insert_label(label(2, Some("a => a * 3"), &[("a", "$.a", false)]))
        .await;
    let controller = quickjs_controller(store.clone());

    let report = controller.run(new_dataset(1)).await.unwrap();

    assert_eq!(report.failed, vec![1]);
    assert_eq!(store.label_value(1, 2).await.unwrap().value, json!(6));
    assert_eq!(store.commit_count().await, 1);
}

#[tokio::test]
async fn test_failing_function_removes_previous_value() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 2}))).await;
    store
        .insert_label(label(1, Some("a => a + 1"), &[("a", "$.a", false)]))
        .await;
    let controller = quickjs_controller(store.clone());
    controller.run(new_dataset(1)).await.unwrap();
    assert_eq!(store.label_value(1, 1).await.unwrap().value, json!(3));

    store
        .insert_label(label(1, Some("a => a.missing.field"), &[("a", "$.a", false)]))
        .await;
    controller
        .run(
            LabelChangedEvent {
                dataset_id: 1,
                label_id: 1,
            }
            .into(),
        )
        .await
        .unwrap();

    assert!(store.label_value(1, 1).await.is_none());
}

#[tokio::test]
async fn test_console_output_is_logged_at_debug() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 2}))).await;
    store
        .insert_label(label(
            1,
            Some("a => { console.log('got', a); return a }"),
            &[("a", "$.a", false)],
        ))
        .await;

    quickjs_controller(store.clone())
        .run(new_dataset(1))
        .await
        .unwrap();

    let logs = store.dataset_logs(1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Debug);
    assert_eq!(
        logs[0].message,
        "Output while calculating label 'label1': got 2"
    );
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let store = MemoryLabelStore::new();
    store
        .insert_dataset(dataset(1, json!({"a": 1, "b": [2, 3]})))
        .await;
    store
        .insert_label(label(1, Some("b => b.reverse()"), &[("b", "$.b[*]", true)]))
        .await;
    store.insert_label(label(2, None, &[("a", "$.a", false)])).await;
    let controller = quickjs_controller(store.clone());

    controller.run(new_dataset(1)).await.unwrap();
    let first: Vec<LabelValue> = store.label_values(1).await;
    controller
        .run(
            NewDatasetEvent {
                dataset_id: 1,
                is_recalculation: true,
            }
            .into(),
        )
        .await
        .unwrap();
    let second: Vec<LabelValue> = store.label_values(1).await;

    assert_eq!(first, second);
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].value, json!([3, 2]));
}

#[tokio::test]
async fn test_functions_disabled_persist_aggregated_value() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 1}))).await;
    store
        .insert_label(label(1, Some("a => a + 1"), &[("a", "$.a", false)]))
        .await;
    let controller = RecalculationController::new(
        store.clone(),
        LabelCalculator::new(Arc::new(NoOpEvaluator)),
        EventBus::default(),
    );

    controller.run(new_dataset(1)).await.unwrap();

    assert_eq!(store.label_value(1, 1).await.unwrap().value, json!(1));
}

#[tokio::test]
async fn test_single_label_trigger_for_unattached_schema_is_noop() {
    let store = MemoryLabelStore::new();
    store.insert_dataset(dataset(1, json!({"a": 1}))).await;
    store
        .insert_label(LabelDefinition {
            schema_id: 99,
            ..label(1, None, &[("a", "$.a", false)])
        })
        .await;
    let controller = quickjs_controller(store.clone());
    let mut events = controller.events().subscribe();

    let report = controller
        .run(
            LabelChangedEvent {
                dataset_id: 1,
                label_id: 1,
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(report.resolved, 0);
    assert!(store.label_values(1).await.is_empty());
    assert_eq!(
        events.try_recv().unwrap().payload,
        LabelEvent::LabelsUpdated {
            dataset_id: 1,
            is_recalculation: true
        }
    );
}

// ============================================================================
// Concurrency
// ============================================================================

/// Store wrapper counting transactions that are open at the same time.
#[derive(Clone)]
struct TrackingStore {
    inner: MemoryLabelStore,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
}

impl TrackingStore {
    fn new(inner: MemoryLabelStore) -> Self {
        Self {
            inner,
            open: Arc::default(),
            max_open: Arc::default(),
        }
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackingTransaction {
    inner: <MemoryLabelStore as LabelStore>::Tx,
    _open: OpenGuard,
}

#[async_trait]
impl LabelStore for TrackingStore {
    type Tx = TrackingTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);
        Ok(TrackingTransaction {
            inner: self.inner.begin().await?,
            _open: OpenGuard(self.open.clone()),
        })
    }
}

#[async_trait]
impl LabelTransaction for TrackingTransaction {
    async fn dataset(&mut self, dataset_id: i32) -> Result<Option<DatasetPayload>> {
        // Widen the window in which an overlapping recalculation would show up
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.dataset(dataset_id).await
    }

    async fn label_definitions(
        &mut self,
        schema_ids: &[i32],
        selector: LabelSelector,
    ) -> Result<Vec<LabelDefinition>> {
        self.inner.label_definitions(schema_ids, selector).await
    }

    async fn extract(
        &mut self,
        document: &JsonValue,
        extractor: &Extractor,
    ) -> Result<Extraction> {
        self.inner.extract(document, extractor).await
    }

    async fn clear_label_values(&mut self, dataset_id: i32, label_ids: &[i32]) -> Result<()> {
        self.inner.clear_label_values(dataset_id, label_ids).await
    }

    async fn upsert_label_value(&mut self, value: &LabelValue) -> Result<()> {
        self.inner.upsert_label_value(value).await
    }

    async fn append_log(&mut self, entry: &DatasetLogEntry) -> Result<()> {
        self.inner.append_log(entry).await
    }

    async fn commit(self) -> Result<()> {
        self.inner.commit().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_never_overlap() {
    let memory = MemoryLabelStore::new();
    for id in 1..=4 {
        memory.insert_dataset(dataset(id, json!({"a": id}))).await;
    }
    memory
        .insert_label(label(1, Some("a => a * 2"), &[("a", "$.a", false)]))
        .await;
    let store = TrackingStore::new(memory.clone());
    let max_open = store.max_open.clone();
    let controller = Arc::new(quickjs_controller(store));
    let mut events = controller.events().subscribe();

    let runs = (1..=4).map(|id| {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run(new_dataset(id)).await })
    });
    for result in futures::future::join_all(runs).await {
        result.unwrap().unwrap();
    }

    assert_eq!(max_open.load(Ordering::SeqCst), 1);
    for id in 1..=4 {
        assert_eq!(
            memory.label_value(id, 1).await.unwrap().value,
            json!(id * 2)
        );
    }
    let mut published = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        published.push(envelope.payload.dataset_id());
    }
    published.sort();
    assert_eq!(published, vec![1, 2, 3, 4]);
}
