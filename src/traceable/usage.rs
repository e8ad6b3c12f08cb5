//! Usage-metadata extraction (spec.md §4.7 "Usage-metadata extraction").
//!
//! Restricted to the three documented shapes only — this is
//! deliberately not a recursive tree search, matching Design Notes'
//! instruction to classify shapes explicitly rather than duck-type.

use serde_json::{Map, Value};

/// Looks for a `usage_metadata` value in `outputs`, trying each
/// documented shape in order and returning the first match:
///
/// 1. Direct: `outputs.usage_metadata`.
/// 2. Nested in a serialized message's `kwargs`: `outputs.<any
///    key>.kwargs.usage_metadata` (one level deep).
/// 3. A `generations[][]` grid: the first generation entry carrying
///    `message.kwargs.usage_metadata`.
pub fn find_usage_metadata(outputs: &Map<String, Value>) -> Option<Value> {
    if let Some(direct) = outputs.get("usage_metadata") {
        return Some(direct.clone());
    }

    for value in outputs.values() {
        if let Some(found) = usage_from_kwargs_holder(value) {
            return Some(found);
        }
    }

    if let Some(Value::Array(rows)) = outputs.get("generations") {
        for row in rows {
            let Value::Array(entries) = row else { continue };
            for entry in entries {
                let Some(message) = entry.get("message") else { continue };
                if let Some(found) = usage_from_kwargs_holder(message) {
                    return Some(found);
                }
            }
        }
    }

    None
}

fn usage_from_kwargs_holder(value: &Value) -> Option<Value> {
    value.get("kwargs")?.get("usage_metadata").cloned()
}

/// Hoists a found usage-metadata value onto `run.extra.metadata.usage_metadata`.
pub(crate) fn apply_usage_metadata(run: &crate::run::Run, outputs: &Map<String, Value>) {
    if let Some(usage) = find_usage_metadata(outputs) {
        run.merge_metadata("usage_metadata", usage);
    }
}
