//! Aggregation of extracted values into a label input.

use serde_json::{Map, Value as JsonValue};

use labeler_core::Extractor;

/// Combine the values extracted for a label.
///
/// `values[i]` is the result of `extractors[i]`. The shape depends on the
/// number of configured extractors: none gives `{}`, one gives its value
/// unwrapped, more give an object keyed by extractor name where a repeated
/// name keeps the last value.
pub fn aggregate(extractors: &[Extractor], values: Vec<JsonValue>) -> JsonValue {
    debug_assert_eq!(extractors.len(), values.len());

    if extractors.len() == 1 {
        return values.into_iter().next().unwrap_or(JsonValue::Null);
    }

    let mut object = Map::new();
    for (extractor, value) in extractors.iter().zip(values) {
        object.insert(extractor.name.clone(), value);
    }
    JsonValue::Object(object)
}
