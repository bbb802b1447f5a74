//! Domain models for datasets, labels, and their computed values.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::defaults::LOG_SOURCE;
use crate::error::Error;

// =============================================================================
// DATASETS
// =============================================================================

/// Location of a schema-tagged sub-document within a dataset payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasetSchema {
    /// Schema the sub-document conforms to.
    pub schema_id: i32,
    /// Schema URI (`$schema` value of the sub-document).
    pub uri: String,
    /// Ordinal index of the sub-document inside the dataset's JSON array.
    pub index: i32,
}

/// A dataset's JSON payload together with its schema annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetPayload {
    pub id: i32,
    pub test_id: i32,
    pub data: JsonValue,
    pub schemas: Vec<DatasetSchema>,
}

impl DatasetPayload {
    /// Return the sub-document at `index`.
    ///
    /// A non-array payload is treated as a single-element array so that
    /// index 0 addresses the whole document.
    pub fn sub_document(&self, index: i32) -> Option<&JsonValue> {
        let index = usize::try_from(index).ok()?;
        match &self.data {
            JsonValue::Array(items) => items.get(index),
            other if index == 0 => Some(other),
            _ => None,
        }
    }

    /// Schema ids attached to this dataset, deduplicated, in attachment order.
    pub fn schema_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = Vec::with_capacity(self.schemas.len());
        for schema in &self.schemas {
            if !ids.contains(&schema.schema_id) {
                ids.push(schema.schema_id);
            }
        }
        ids
    }
}

// =============================================================================
// LABELS
// =============================================================================

/// A named JSONPath rule contributing to a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extractor {
    /// Key under which the extracted value appears in the aggregated object.
    pub name: String,
    /// JSONPath expression evaluated against the schema sub-document.
    pub jsonpath: String,
    /// Collect every match into an array instead of taking the first one.
    pub is_array: bool,
}

impl Extractor {
    pub fn new(name: impl Into<String>, jsonpath: impl Into<String>, is_array: bool) -> Self {
        Self {
            name: name.into(),
            jsonpath: jsonpath.into(),
            is_array,
        }
    }
}

/// Label definition as owned by a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub id: i32,
    pub name: String,
    pub schema_id: i32,
    /// Optional transform function source, invoked with the aggregated value.
    pub function: Option<String>,
    pub extractors: Vec<Extractor>,
}

/// Which labels of a dataset a recalculation should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelSelector {
    /// Every label of every schema attached to the dataset.
    All,
    /// Only the given label, if it applies to the dataset.
    Single(i32),
}

impl LabelSelector {
    /// Label id filter, `None` for [`LabelSelector::All`].
    pub fn label_id(&self) -> Option<i32> {
        match self {
            LabelSelector::All => None,
            LabelSelector::Single(id) => Some(*id),
        }
    }

    pub fn matches(&self, label_id: i32) -> bool {
        match self {
            LabelSelector::All => true,
            LabelSelector::Single(id) => *id == label_id,
        }
    }
}

/// Computed value of one label for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LabelValue {
    pub dataset_id: i32,
    pub label_id: i32,
    pub value: JsonValue,
}

// =============================================================================
// DIAGNOSTIC LOG
// =============================================================================

/// Severity of a persisted diagnostic entry.
///
/// Stored as its integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(level: i32) -> Option<Self> {
        match level {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warning),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Append-only diagnostic record surfaced to operators per dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetLogEntry {
    pub test_id: i32,
    pub dataset_id: i32,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DatasetLogEntry {
    /// Create an entry tagged with the label engine's source.
    pub fn labels(
        test_id: i32,
        dataset_id: i32,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            test_id,
            dataset_id,
            level,
            source: LOG_SOURCE.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// TRIGGERS
// =============================================================================

/// A new dataset was created and needs all of its labels computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDatasetEvent {
    pub dataset_id: i32,
    pub is_recalculation: bool,
}

impl FromStr for NewDatasetEvent {
    type Err = Error;

    /// Parse a `"<datasetId>;<isRecalculation>"` payload. The flag may be
    /// omitted, in which case it defaults to `false`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || Error::InvalidTrigger(format!("new dataset payload: {}", s));
        let mut parts = s.split(';');
        let dataset_id = parts
            .next()
            .and_then(|p| p.trim().parse::<i32>().ok())
            .ok_or_else(invalid)?;
        let is_recalculation = match parts.next().map(str::trim) {
            None | Some("") => false,
            Some(flag) => match flag.to_lowercase().as_str() {
                "true" | "t" | "1" => true,
                "false" | "f" | "0" => false,
                _ => return Err(invalid()),
            },
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            dataset_id,
            is_recalculation,
        })
    }
}

/// A label definition was added or changed for a dataset's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChangedEvent {
    pub dataset_id: i32,
    pub label_id: i32,
}

impl FromStr for LabelChangedEvent {
    type Err = Error;

    /// Parse a `"<datasetId>;<labelId>"` payload.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(';').collect();
        let [dataset, label] = parts.as_slice() else {
            return Err(Error::InvalidTrigger(format!("label change payload: {}", s)));
        };
        let parse = |p: &str| {
            p.trim()
                .parse::<i32>()
                .map_err(|e| Error::InvalidTrigger(format!("label change payload {}: {}", s, e)))
        };
        Ok(Self {
            dataset_id: parse(dataset)?,
            label_id: parse(label)?,
        })
    }
}

/// A request to (re)compute labels of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalculationTrigger {
    NewDataset(NewDatasetEvent),
    LabelChanged(LabelChangedEvent),
}

impl RecalculationTrigger {
    pub fn dataset_id(&self) -> i32 {
        match self {
            RecalculationTrigger::NewDataset(e) => e.dataset_id,
            RecalculationTrigger::LabelChanged(e) => e.dataset_id,
        }
    }

    pub fn selector(&self) -> LabelSelector {
        match self {
            RecalculationTrigger::NewDataset(_) => LabelSelector::All,
            RecalculationTrigger::LabelChanged(e) => LabelSelector::Single(e.label_id),
        }
    }

    /// Label definition changes always count as recalculations.
    pub fn is_recalculation(&self) -> bool {
        match self {
            RecalculationTrigger::NewDataset(e) => e.is_recalculation,
            RecalculationTrigger::LabelChanged(_) => true,
        }
    }

    /// Short name used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RecalculationTrigger::NewDataset(_) => "new_dataset",
            RecalculationTrigger::LabelChanged(_) => "label_changed",
        }
    }
}

impl From<NewDatasetEvent> for RecalculationTrigger {
    fn from(e: NewDatasetEvent) -> Self {
        RecalculationTrigger::NewDataset(e)
    }
}

impl From<LabelChangedEvent> for RecalculationTrigger {
    fn from(e: LabelChangedEvent) -> Self {
        RecalculationTrigger::LabelChanged(e)
    }
}
