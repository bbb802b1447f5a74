//! Storage traits for the label calculation engine.
//!
//! A recalculation reads the dataset and label definitions and writes label
//! values and diagnostics inside one transaction. Backends implement
//! [`LabelStore`] to open such a transaction and [`LabelTransaction`] for the
//! operations performed inside it.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::extract::{self, Extraction};
use crate::models::*;

/// Factory for recalculation transactions.
#[async_trait]
pub trait LabelStore: Send + Sync + 'static {
    /// Transaction type produced by this store.
    type Tx: LabelTransaction;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;
}

/// Operations available inside a single recalculation transaction.
///
/// Dropping a transaction without calling [`LabelTransaction::commit`] rolls
/// back every write made through it.
#[async_trait]
pub trait LabelTransaction: Send + Sized {
    /// Fetch a dataset payload and its schema annotations.
    async fn dataset(&mut self, dataset_id: i32) -> Result<Option<DatasetPayload>>;

    /// Fetch label definitions (with extractors, ordered by label id) owned
    /// by any of the given schemas and accepted by `selector`.
    async fn label_definitions(
        &mut self,
        schema_ids: &[i32],
        selector: LabelSelector,
    ) -> Result<Vec<LabelDefinition>>;

    /// Evaluate one extractor against a schema sub-document.
    ///
    /// A path that cannot be evaluated is reported in the returned
    /// [`Extraction`]; only storage failures are errors. The default runs the
    /// path in process.
    async fn extract(
        &mut self,
        document: &JsonValue,
        extractor: &Extractor,
    ) -> Result<Extraction> {
        Ok(extract::extract(document, extractor))
    }

    /// Remove the current values of the given labels for a dataset.
    async fn clear_label_values(&mut self, dataset_id: i32, label_ids: &[i32]) -> Result<()>;

    /// Store a label value, replacing any live value for the same pair.
    async fn upsert_label_value(&mut self, value: &LabelValue) -> Result<()>;

    /// Append a diagnostic entry.
    async fn append_log(&mut self, entry: &DatasetLogEntry) -> Result<()>;

    /// Make every write visible.
    async fn commit(self) -> Result<()>;
}
