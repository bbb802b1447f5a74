//! Label computation for one dataset inside a store transaction.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use labeler_core::{
    DatasetLogEntry, Error, Extraction, LabelSelector, LabelTransaction, LabelValue, LogLevel,
    Result,
};

use crate::aggregate::aggregate;
use crate::evaluator::LabelEvaluator;
use crate::resolver::{resolve_labels, ResolvedLabel};

/// Summary of one dataset computation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CalculationReport {
    pub dataset_id: i32,
    /// Labels that applied to the dataset.
    pub resolved: usize,
    /// Labels whose value was written.
    pub persisted: Vec<i32>,
    /// Labels whose function failed; they have no value after commit.
    pub failed: Vec<i32>,
    /// Extractors that could not run.
    pub extraction_warnings: usize,
}

/// Computes label values and stages them in a transaction.
///
/// The calculator never commits; the caller owns the transaction.
#[derive(Clone)]
pub struct LabelCalculator {
    evaluator: Arc<dyn LabelEvaluator>,
}

impl LabelCalculator {
    pub fn new(evaluator: Arc<dyn LabelEvaluator>) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &Arc<dyn LabelEvaluator> {
        &self.evaluator
    }

    /// Compute the labels of `dataset_id` matched by `selector`.
    ///
    /// Existing values of every resolved label are removed first, so a label
    /// whose function fails ends up without a value. Extraction and function
    /// failures are recorded as diagnostic entries and do not fail the call;
    /// storage errors and an unknown dataset do.
    pub async fn calculate<T: LabelTransaction>(
        &self,
        tx: &mut T,
        dataset_id: i32,
        selector: LabelSelector,
    ) -> Result<CalculationReport> {
        let start = Instant::now();
        let dataset = tx
            .dataset(dataset_id)
            .await?
            .ok_or(Error::DatasetNotFound(dataset_id))?;

        let definitions = tx
            .label_definitions(&dataset.schema_ids(), selector)
            .await?;
        let labels = resolve_labels(&dataset, definitions, selector);

        let label_ids: Vec<i32> = labels.iter().map(|l| l.label_id).collect();
        tx.clear_label_values(dataset.id, &label_ids).await?;

        let mut report = CalculationReport {
            dataset_id: dataset.id,
            resolved: labels.len(),
            ..Default::default()
        };

        for label in &labels {
            let log = |level: LogLevel, message: String| {
                DatasetLogEntry::labels(dataset.test_id, dataset.id, level, message)
            };

            let document = dataset.sub_document(label.schema_index);
            let mut values = Vec::with_capacity(label.cardinality());
            let mut warnings = Vec::new();
            for extractor in &label.extractors {
                let extraction = match document {
                    Some(document) => tx.extract(document, extractor).await?,
                    None => Extraction::failed(extractor, "schema sub-document not found"),
                };
                if let Some(error) = extraction.error {
                    warnings.push(log(
                        LogLevel::Warning,
                        format!(
                            "Cannot extract '{}' for label '{}': {}",
                            extractor.name, label.name, error
                        ),
                    ));
                }
                values.push(extraction.value);
            }
            report.extraction_warnings += warnings.len();
            for entry in &warnings {
                tx.append_log(entry).await?;
            }

            let input = aggregate(&label.extractors, values);
            match self.evaluate(label, input).await {
                Ok((value, output)) => {
                    if let Some(output) = output {
                        tx.append_log(&log(LogLevel::Debug, output)).await?;
                    }
                    tx.upsert_label_value(&LabelValue {
                        dataset_id: dataset.id,
                        label_id: label.label_id,
                        value,
                    })
                    .await?;
                    report.persisted.push(label.label_id);
                }
                Err((message, output)) => {
                    if let Some(output) = output {
                        tx.append_log(&log(LogLevel::Debug, output)).await?;
                    }
                    tx.append_log(&log(LogLevel::Error, message)).await?;
                    report.failed.push(label.label_id);
                }
            }
        }

        debug!(
            subsystem = "jobs",
            component = "calculator",
            dataset_id = dataset.id,
            label_count = report.resolved,
            value_count = report.persisted.len(),
            failed_count = report.failed.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Calculated labels"
        );
        Ok(report)
    }

    /// Run the label's function, if any.
    ///
    /// Returns the final value or the failure message, each with the debug
    /// entry text for captured console output.
    async fn evaluate(
        &self,
        label: &ResolvedLabel,
        input: JsonValue,
    ) -> std::result::Result<(JsonValue, Option<String>), (String, Option<String>)> {
        let Some(source) = label.function() else {
            return Ok((input, None));
        };

        let evaluation = self.evaluator.evaluate(source, input).await;
        let output = (!evaluation.output.is_empty()).then(|| {
            format!(
                "Output while calculating label '{}': {}",
                label.name, evaluation.output
            )
        });

        match evaluation.result {
            Ok(value) => Ok((value, output)),
            Err(error) => {
                warn!(
                    subsystem = "jobs",
                    component = "calculator",
                    label_id = label.label_id,
                    evaluator = self.evaluator.name(),
                    error = %error,
                    "Label function failed"
                );
                Err((
                    format!(
                        "Evaluation of label '{}' failed: '{}' Code: {}",
                        label.name, error, source
                    ),
                    output,
                ))
            }
        }
    }
}
