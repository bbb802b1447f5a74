//! In-memory label store.
//!
//! Used by tests and by embedders that keep datasets in process. Writes made
//! through a [`MemoryLabelTransaction`] are staged and applied atomically on
//! commit; dropping the transaction discards them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use labeler_core::{
    DatasetLogEntry, DatasetPayload, Error, LabelDefinition, LabelSelector, LabelStore,
    LabelTransaction, LabelValue, Result,
};

#[derive(Default)]
struct MemoryState {
    datasets: HashMap<i32, DatasetPayload>,
    labels: BTreeMap<i32, LabelDefinition>,
    values: BTreeMap<(i32, i32), JsonValue>,
    logs: Vec<DatasetLogEntry>,
    /// Physical value writes, including overwrites.
    value_writes: u64,
    commits: u64,
    failing_commits: usize,
}

/// Thread-safe in-memory implementation of [`LabelStore`].
#[derive(Clone, Default)]
pub struct MemoryLabelStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a dataset.
    pub async fn insert_dataset(&self, dataset: DatasetPayload) {
        self.state.write().await.datasets.insert(dataset.id, dataset);
    }

    /// Add or replace a label definition.
    pub async fn insert_label(&self, label: LabelDefinition) {
        self.state.write().await.labels.insert(label.id, label);
    }

    pub async fn remove_label(&self, label_id: i32) -> Option<LabelDefinition> {
        self.state.write().await.labels.remove(&label_id)
    }

    /// Make the next `n` commits fail as if the storage layer aborted them.
    pub async fn fail_next_commits(&self, n: usize) {
        self.state.write().await.failing_commits = n;
    }

    pub async fn label_value(&self, dataset_id: i32, label_id: i32) -> Option<LabelValue> {
        self.state
            .read()
            .await
            .values
            .get(&(dataset_id, label_id))
            .map(|value| LabelValue {
                dataset_id,
                label_id,
                value: value.clone(),
            })
    }

    /// Live label values of a dataset, ordered by label id.
    pub async fn label_values(&self, dataset_id: i32) -> Vec<LabelValue> {
        self.state
            .read()
            .await
            .values
            .range((dataset_id, i32::MIN)..=(dataset_id, i32::MAX))
            .map(|(&(dataset_id, label_id), value)| LabelValue {
                dataset_id,
                label_id,
                value: value.clone(),
            })
            .collect()
    }

    pub async fn dataset_logs(&self, dataset_id: i32) -> Vec<DatasetLogEntry> {
        self.state
            .read()
            .await
            .logs
            .iter()
            .filter(|entry| entry.dataset_id == dataset_id)
            .cloned()
            .collect()
    }

    pub async fn value_writes(&self) -> u64 {
        self.state.read().await.value_writes
    }

    pub async fn commit_count(&self) -> u64 {
        self.state.read().await.commits
    }
}

#[async_trait]
impl LabelStore for MemoryLabelStore {
    type Tx = MemoryLabelTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(MemoryLabelTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
        })
    }
}

enum StagedWrite {
    Clear { dataset_id: i32, label_ids: Vec<i32> },
    Upsert(LabelValue),
    Log(DatasetLogEntry),
}

/// Transaction over a [`MemoryLabelStore`].
pub struct MemoryLabelTransaction {
    state: Arc<RwLock<MemoryState>>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl LabelTransaction for MemoryLabelTransaction {
    async fn dataset(&mut self, dataset_id: i32) -> Result<Option<DatasetPayload>> {
        Ok(self.state.read().await.datasets.get(&dataset_id).cloned())
    }

    async fn label_definitions(
        &mut self,
        schema_ids: &[i32],
        selector: LabelSelector,
    ) -> Result<Vec<LabelDefinition>> {
        Ok(self
            .state
            .read()
            .await
            .labels
            .values()
            .filter(|label| schema_ids.contains(&label.schema_id) && selector.matches(label.id))
            .cloned()
            .collect())
    }

    async fn clear_label_values(&mut self, dataset_id: i32, label_ids: &[i32]) -> Result<()> {
        self.staged.push(StagedWrite::Clear {
            dataset_id,
            label_ids: label_ids.to_vec(),
        });
        Ok(())
    }

    async fn upsert_label_value(&mut self, value: &LabelValue) -> Result<()> {
        self.staged.push(StagedWrite::Upsert(value.clone()));
        Ok(())
    }

    async fn append_log(&mut self, entry: &DatasetLogEntry) -> Result<()> {
        self.staged.push(StagedWrite::Log(entry.clone()));
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(Error::Internal(
                "could not serialize access due to read/write dependencies among transactions"
                    .to_string(),
            ));
        }
        for write in self.staged {
            match write {
                StagedWrite::Clear {
                    dataset_id,
                    label_ids,
                } => {
                    for label_id in label_ids {
                        state.values.remove(&(dataset_id, label_id));
                    }
                }
                StagedWrite::Upsert(value) => {
                    state
                        .values
                        .insert((value.dataset_id, value.label_id), value.value);
                    state.value_writes += 1;
                }
                StagedWrite::Log(entry) => state.logs.push(entry),
            }
        }
        state.commits += 1;
        Ok(())
    }
}
