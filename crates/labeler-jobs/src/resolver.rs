//! Resolution of the labels that apply to a dataset.

use std::collections::HashMap;

use labeler_core::{DatasetPayload, Extractor, LabelDefinition, LabelSelector};

/// A label bound to the sub-document it is computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLabel {
    pub label_id: i32,
    pub name: String,
    pub function: Option<String>,
    /// Index of the schema sub-document inside the dataset payload.
    pub schema_index: i32,
    pub extractors: Vec<Extractor>,
}

impl ResolvedLabel {
    /// Number of configured extractors.
    pub fn cardinality(&self) -> usize {
        self.extractors.len()
    }

    /// Function source, if one is configured and not blank.
    pub fn function(&self) -> Option<&str> {
        self.function
            .as_deref()
            .filter(|source| !source.trim().is_empty())
    }
}

/// Bind label definitions to the dataset's schema sub-documents.
///
/// Definitions whose schema is not attached to the dataset, or which the
/// selector excludes, are skipped. A schema attached at several indexes is
/// resolved to the lowest one. The result is ordered by label id.
pub fn resolve_labels(
    dataset: &DatasetPayload,
    definitions: Vec<LabelDefinition>,
    selector: LabelSelector,
) -> Vec<ResolvedLabel> {
    let mut schema_index: HashMap<i32, i32> = HashMap::new();
    for schema in &dataset.schemas {
        schema_index
            .entry(schema.schema_id)
            .and_modify(|index| *index = (*index).min(schema.index))
            .or_insert(schema.index);
    }

    let mut resolved: Vec<ResolvedLabel> = definitions
        .into_iter()
        .filter(|label| selector.matches(label.id))
        .filter_map(|label| {
            let index = *schema_index.get(&label.schema_id)?;
            Some(ResolvedLabel {
                label_id: label.id,
                name: label.name,
                function: label.function,
                schema_index: index,
                extractors: label.extractors,
            })
        })
        .collect();

    resolved.sort_by_key(|label| label.label_id);
    resolved.dedup_by_key(|label| label.label_id);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use labeler_core::DatasetSchema;
    use serde_json::json;

    fn dataset(schemas: &[(i32, i32)]) -> DatasetPayload {
        DatasetPayload {
            id: 1,
            test_id: 1,
            data: json!([{}, {}, {}]),
            schemas: schemas
                .iter()
                .map(|&(schema_id, index)| DatasetSchema {
                    schema_id,
                    uri: format!("urn:schema:{}", schema_id),
                    index,
                })
                .collect(),
        }
    }

    fn label(id: i32, schema_id: i32, extractors: usize) -> LabelDefinition {
        LabelDefinition {
            id,
            name: format!("label-{}", id),
            schema_id,
            function: None,
            extractors: (0..extractors)
                .map(|i| Extractor::new(format!("e{}", i), format!("$.e{}", i), false))
                .collect(),
        }
    }

    #[test]
    fn test_resolves_labels_of_attached_schemas_in_id_order() {
        let ds = dataset(&[(10, 0), (20, 1)]);
        let resolved = resolve_labels(
            &ds,
            vec![label(5, 20, 1), label(2, 10, 2), label(9, 30, 1)],
            LabelSelector::All,
        );

        let ids: Vec<i32> = resolved.iter().map(|l| l.label_id).collect();
        assert_eq!(ids, vec![2, 5]);
        assert_eq!(resolved[0].schema_index, 0);
        assert_eq!(resolved[0].cardinality(), 2);
        assert_eq!(resolved[1].schema_index, 1);
    }

    #[test]
    fn test_label_without_extractors_has_zero_cardinality() {
        let ds = dataset(&[(10, 0)]);
        let resolved = resolve_labels(&ds, vec![label(1, 10, 0)], LabelSelector::All);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].cardinality(), 0);
    }

    #[test]
    fn test_single_selector_for_unattached_schema_yields_nothing() {
        let ds = dataset(&[(10, 0)]);
        let resolved = resolve_labels(
            &ds,
            vec![label(1, 10, 1), label(2, 20, 1)],
            LabelSelector::Single(2),
        );
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_duplicated_schema_uses_lowest_index() {
        let ds = dataset(&[(10, 2), (10, 1)]);
        let resolved = resolve_labels(&ds, vec![label(1, 10, 1)], LabelSelector::All);
        assert_eq!(resolved[0].schema_index, 1);
    }

    #[test]
    fn test_blank_function_is_ignored() {
        let mut def = label(1, 10, 1);
        def.function = Some("  ".to_string());
        let resolved = resolve_labels(&dataset(&[(10, 0)]), vec![def], LabelSelector::All);
        assert_eq!(resolved[0].function(), None);
    }
}
