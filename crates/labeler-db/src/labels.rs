//! PostgreSQL implementation of the label store.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, trace};

use labeler_core::{
    DatasetLogEntry, DatasetPayload, DatasetSchema, Error, Extraction, Extractor,
    LabelDefinition, LabelSelector, LabelStore, LabelTransaction, LabelValue, LogLevel, Result,
};

/// Savepoint wrapping each extractor so a bad path leaves the transaction usable.
const EXTRACT_SAVEPOINT: &str = "label_extract";

/// Transaction isolation used for recalculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// PostgreSQL implementation of [`LabelStore`].
#[derive(Clone)]
pub struct PgLabelStore {
    pool: Pool<Postgres>,
    isolation: IsolationLevel,
}

impl PgLabelStore {
    /// Create a store running recalculations at `SERIALIZABLE` isolation.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Fetch the live value of one label for a dataset.
    pub async fn label_value(&self, dataset_id: i32, label_id: i32) -> Result<Option<LabelValue>> {
        sqlx::query_as::<_, LabelValue>(
            "SELECT dataset_id, label_id, value FROM label_values
             WHERE dataset_id = $1 AND label_id = $2",
        )
        .bind(dataset_id)
        .bind(label_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)
    }

    /// Fetch all live label values of a dataset, ordered by label id.
    pub async fn label_values(&self, dataset_id: i32) -> Result<Vec<LabelValue>> {
        sqlx::query_as::<_, LabelValue>(
            "SELECT dataset_id, label_id, value FROM label_values
             WHERE dataset_id = $1 ORDER BY label_id",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    /// Fetch diagnostic entries written by the label engine for a dataset.
    pub async fn dataset_logs(&self, dataset_id: i32) -> Result<Vec<DatasetLogEntry>> {
        let rows = sqlx::query(
            "SELECT testid, dataset_id, level, source, message, timestamp FROM dataset_log
             WHERE dataset_id = $1 AND source = $2 ORDER BY id",
        )
        .bind(dataset_id)
        .bind(labeler_core::defaults::LOG_SOURCE)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let level: i32 = row.get("level");
                Ok(DatasetLogEntry {
                    test_id: row.get("testid"),
                    dataset_id: row.get("dataset_id"),
                    level: LogLevel::from_i32(level).ok_or_else(|| {
                        Error::Internal(format!("Unknown dataset log level: {}", level))
                    })?,
                    source: row.get("source"),
                    message: row.get("message"),
                    timestamp: row.get("timestamp"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl LabelStore for PgLabelStore {
    type Tx = PgLabelTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sqlx::query(self.isolation.as_sql())
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        Ok(PgLabelTransaction { tx })
    }
}

/// A recalculation transaction on PostgreSQL.
pub struct PgLabelTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgLabelTransaction {
    async fn savepoint(&mut self, command: &str) -> Result<()> {
        sqlx::query(&format!("{} {}", command, EXTRACT_SAVEPOINT))
            .execute(&mut *self.tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

/// Message of a `jsonpath` query failure caused by the path itself: syntax
/// errors (class 42) and SQL/JSON data exceptions (class 22).
fn path_error_message(error: &sqlx::Error) -> Option<String> {
    let sqlx::Error::Database(db_error) = error else {
        return None;
    };
    let code = db_error.code()?;
    (code.starts_with("42") || code.starts_with("22")).then(|| db_error.message().to_string())
}

#[async_trait]
impl LabelTransaction for PgLabelTransaction {
    async fn dataset(&mut self, dataset_id: i32) -> Result<Option<DatasetPayload>> {
        let row = sqlx::query("SELECT id, testid, data FROM dataset WHERE id = $1")
            .bind(dataset_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let schemas = sqlx::query_as::<_, DatasetSchema>(
            "SELECT schema_id, uri, index FROM dataset_schemas
             WHERE dataset_id = $1 ORDER BY index",
        )
        .bind(dataset_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        Ok(Some(DatasetPayload {
            id: row.get("id"),
            test_id: row.get("testid"),
            data: row.get("data"),
            schemas,
        }))
    }

    async fn label_definitions(
        &mut self,
        schema_ids: &[i32],
        selector: LabelSelector,
    ) -> Result<Vec<LabelDefinition>> {
        if schema_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT
                label.id AS label_id,
                label.name AS label_name,
                label.schema_id,
                label.function,
                le.name AS extractor_name,
                le.jsonpath,
                le.isarray
            FROM label
            LEFT JOIN label_extractors le ON le.label_id = label.id
            WHERE label.schema_id = ANY($1)
              AND ($2::integer IS NULL OR label.id = $2)
            ORDER BY label.id, le.id
            "#,
        )
        .bind(schema_ids)
        .bind(selector.label_id())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        let mut labels: Vec<LabelDefinition> = Vec::new();
        for row in rows {
            let label_id: i32 = row.get("label_id");
            if labels.last().map(|l| l.id) != Some(label_id) {
                labels.push(LabelDefinition {
                    id: label_id,
                    name: row.get("label_name"),
                    schema_id: row.get("schema_id"),
                    function: row.get("function"),
                    extractors: Vec::new(),
                });
            }
            // LEFT JOIN yields a single all-NULL extractor row for labels without extractors
            let name: Option<String> = row.get("extractor_name");
            let jsonpath: Option<String> = row.get("jsonpath");
            if let (Some(name), Some(jsonpath), Some(label)) = (name, jsonpath, labels.last_mut()) {
                let is_array: Option<bool> = row.get("isarray");
                label
                    .extractors
                    .push(Extractor::new(name, jsonpath, is_array.unwrap_or(false)));
            }
        }

        trace!(
            subsystem = "db",
            component = "labels",
            label_count = labels.len(),
            "Loaded label definitions"
        );
        Ok(labels)
    }

    /// Runs the path with `jsonb_path_query_array` / `jsonb_path_query_first`
    /// in lax mode, so member access unwraps arrays and quoted member names
    /// are accepted.
    async fn extract(
        &mut self,
        document: &JsonValue,
        extractor: &Extractor,
    ) -> Result<Extraction> {
        let query = if extractor.is_array {
            "SELECT jsonb_path_query_array($1::jsonb, $2::jsonpath) AS value"
        } else {
            "SELECT jsonb_path_query_first($1::jsonb, $2::jsonpath) AS value"
        };

        self.savepoint("SAVEPOINT").await?;
        let result = sqlx::query(query)
            .bind(document)
            .bind(&extractor.jsonpath)
            .fetch_one(&mut *self.tx)
            .await;

        match result {
            Ok(row) => {
                self.savepoint("RELEASE SAVEPOINT").await?;
                let value: Option<JsonValue> = row.get("value");
                Ok(Extraction::found(extractor, value))
            }
            Err(e) => match path_error_message(&e) {
                Some(message) => {
                    self.savepoint("ROLLBACK TO SAVEPOINT").await?;
                    debug!(
                        subsystem = "db",
                        component = "labels",
                        jsonpath = %extractor.jsonpath,
                        error = %message,
                        "Extractor path rejected"
                    );
                    Ok(Extraction::failed(
                        extractor,
                        format!("invalid JSONPath '{}': {}", extractor.jsonpath, message),
                    ))
                }
                None => Err(Error::Database(e)),
            },
        }
    }

    async fn clear_label_values(&mut self, dataset_id: i32, label_ids: &[i32]) -> Result<()> {
        if label_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM label_values WHERE dataset_id = $1 AND label_id = ANY($2)")
            .bind(dataset_id)
            .bind(label_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn upsert_label_value(&mut self, value: &LabelValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO label_values (dataset_id, label_id, value) VALUES ($1, $2, $3)
             ON CONFLICT (dataset_id, label_id) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(value.dataset_id)
        .bind(value.label_id)
        .bind(&value.value)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn append_log(&mut self, entry: &DatasetLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO dataset_log (testid, dataset_id, level, source, message, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.test_id)
        .bind(entry.dataset_id)
        .bind(entry.level.as_i32())
        .bind(&entry.source)
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(Error::Database)
    }
}
