//! JSONPath extraction of label inputs.
//!
//! This is the in-process evaluation used by stores that cannot run paths
//! themselves. It follows RFC 9535; the PostgreSQL store overrides
//! [`LabelTransaction::extract`](crate::LabelTransaction::extract) with the
//! database's lax-mode `jsonpath`.

use serde_json::Value as JsonValue;
use serde_json_path::JsonPath;

use crate::models::Extractor;

/// Value produced by one extractor, with the reason it is empty if
/// extraction could not run.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub value: JsonValue,
    pub error: Option<String>,
}

impl Extraction {
    /// A successful extraction; `None` means nothing matched.
    pub fn found(extractor: &Extractor, value: Option<JsonValue>) -> Self {
        Self {
            value: value.unwrap_or_else(|| empty_value(extractor)),
            error: None,
        }
    }

    pub fn failed(extractor: &Extractor, error: impl Into<String>) -> Self {
        Self {
            value: empty_value(extractor),
            error: Some(error.into()),
        }
    }
}

fn empty_value(extractor: &Extractor) -> JsonValue {
    if extractor.is_array {
        JsonValue::Array(Vec::new())
    } else {
        JsonValue::Null
    }
}

/// Evaluate `extractor` against a schema sub-document.
///
/// Array extractors collect every match in document order, scalar extractors
/// take the first match. No match yields `[]` or `null` respectively; so does
/// an unparsable path, which also sets [`Extraction::error`].
pub fn extract(document: &JsonValue, extractor: &Extractor) -> Extraction {
    let path = match JsonPath::parse(&extractor.jsonpath) {
        Ok(path) => path,
        Err(e) => {
            return Extraction::failed(
                extractor,
                format!("invalid JSONPath '{}': {}", extractor.jsonpath, e),
            )
        }
    };

    let nodes = path.query(document);
    let value = if extractor.is_array {
        Some(JsonValue::Array(nodes.all().into_iter().cloned().collect()))
    } else {
        nodes.first().cloned()
    };

    Extraction::found(extractor, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_extractor_takes_first_match() {
        let doc = json!({"runs": [{"t": 3}, {"t": 4}]});
        let result = extract(&doc, &Extractor::new("t", "$.runs[*].t", false));
        assert_eq!(result.value, json!(3));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_array_extractor_collects_all_matches() {
        let doc = json!({"b": [2, 3]});
        let result = extract(&doc, &Extractor::new("b", "$.b[*]", true));
        assert_eq!(result.value, json!([2, 3]));
    }

    #[test]
    fn test_no_match_yields_null_or_empty_array() {
        let doc = json!({"a": 1});
        assert_eq!(
            extract(&doc, &Extractor::new("x", "$.x", false)).value,
            JsonValue::Null
        );
        let result = extract(&doc, &Extractor::new("x", "$.x[*]", true));
        assert_eq!(result.value, json!([]));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_malformed_path_reports_error() {
        let doc = json!({"a": 1});
        let result = extract(&doc, &Extractor::new("a", "$.a[", true));
        assert_eq!(result.value, json!([]));
        let error = result.error.unwrap();
        assert!(error.contains("$.a["), "{}", error);
    }

    #[test]
    fn test_failed_extraction_is_empty() {
        let result = Extraction::failed(&Extractor::new("a", "$.a", false), "no document");
        assert_eq!(result.value, JsonValue::Null);
        assert_eq!(result.error.as_deref(), Some("no document"));
    }
}
