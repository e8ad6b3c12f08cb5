//! Input/output shaping and the deferred-input path for streamed or
//! promised arguments (spec.md §4.7 "Input capture" / "Deferred inputs").

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{Map, Value};

/// Shapes a call's arguments into the input mapping spec.md §4.7
/// mandates: no args → `{}`; one arg that is itself a mapping → the
/// mapping verbatim; one arg that is a primitive or non-object value →
/// `{input: arg}`; multiple args → `{args: [...]}`.
pub fn shape_inputs(args: Vec<Value>) -> Map<String, Value> {
    let mut args = args;
    match args.len() {
        0 => Map::new(),
        1 => match args.pop().unwrap() {
            Value::Object(map) => map,
            other => {
                let mut m = Map::new();
                m.insert("input".to_string(), other);
                m
            }
        },
        _ => {
            let mut m = Map::new();
            m.insert("args".to_string(), Value::Array(args));
            m
        }
    }
}

/// Shapes a returned value into the `outputs` mapping: an object value
/// is used verbatim, anything else is wrapped under `{outputs: value}`
/// (matching scenario S1: `add_value("x", 1)` returning the primitive
/// `"x1"` records `outputs = {outputs: "x1"}`).
pub fn shape_output(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        other => {
            let mut m = Map::new();
            m.insert("outputs".to_string(), other.clone());
            m
        }
    }
}

/// A user-supplied input transform. Applied through `catch_unwind` so a
/// panicking transform degrades to the raw inputs (spec.md: "errors in
/// it fall back to the raw inputs and are logged") rather than poisoning
/// the call.
pub type ProcessInputs = Arc<dyn Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync>;

pub(crate) fn apply_process_inputs(
    process_inputs: Option<&ProcessInputs>,
    raw: Map<String, Value>,
) -> Map<String, Value> {
    let Some(f) = process_inputs else { return raw };
    let raw_for_fallback = raw.clone();
    match catch_unwind(AssertUnwindSafe(|| f(raw))) {
        Ok(shaped) => shaped,
        Err(_) => {
            tracing::warn!("processInputs transform panicked; falling back to raw inputs");
            raw_for_fallback
        }
    }
}

/// One extracted binary attachment: `(name, mime_type, bytes)`.
pub type Attachment = (String, String, Bytes);

/// Pulls attachments out of the raw argument list before it becomes the
/// captured input mapping, per spec.md's `extractAttachments` hook.
/// Only the remaining args are shaped into inputs; the attachments are
/// registered on the run separately.
pub type ExtractAttachments =
    Arc<dyn Fn(Vec<Value>) -> (Vec<Attachment>, Vec<Value>) + Send + Sync>;

/// Holds resolved values for arguments that were themselves streams or
/// futures at call time, so the run's `inputs` can be reconstructed
/// after the wrapped function has fully consumed them — see
/// [`crate::traceable::trace_call_deferred`].
#[derive(Clone, Default)]
pub struct DeferredInputs {
    resolved: Arc<Mutex<Map<String, Value>>>,
}

impl DeferredInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or overwrites) the resolved value for a named argument.
    /// Called by the proxy wrapping a streamed/promised argument each
    /// time more of it becomes available.
    pub fn record(&self, name: impl Into<String>, value: Value) {
        self.resolved
            .lock()
            .expect("deferred-inputs map poisoned")
            .insert(name.into(), value);
    }

    /// Wraps a future argument so its resolved value is recorded under
    /// `name` the moment it completes.
    pub async fn wrap_future<Fut, T>(&self, name: impl Into<String>, fut: Fut) -> T
    where
        Fut: std::future::Future<Output = T>,
        T: serde::Serialize,
    {
        let name = name.into();
        let value = fut.await;
        self.record(name, serde_json::to_value(&value).unwrap_or(Value::Null));
        value
    }

    /// The resolved inputs collected so far.
    pub fn resolved(&self) -> Map<String, Value> {
        self.resolved.lock().expect("deferred-inputs map poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_inputs_matches_spec_cases() {
        assert_eq!(shape_inputs(vec![]), Map::new());

        let mut obj = Map::new();
        obj.insert("x".into(), Value::from(1));
        assert_eq!(shape_inputs(vec![Value::Object(obj.clone())]), obj);

        let mut expect_primitive = Map::new();
        expect_primitive.insert("input".into(), Value::from("x"));
        assert_eq!(shape_inputs(vec![Value::from("x")]), expect_primitive);

        let mut expect_multi = Map::new();
        expect_multi.insert("args".into(), Value::Array(vec![Value::from("x"), Value::from(1)]));
        assert_eq!(shape_inputs(vec![Value::from("x"), Value::from(1)]), expect_multi);
    }

    #[test]
    fn shape_output_wraps_non_object_values() {
        let mut expect = Map::new();
        expect.insert("outputs".into(), Value::from("x1"));
        assert_eq!(shape_output(&Value::from("x1")), expect);

        let mut obj = Map::new();
        obj.insert("a".into(), Value::from(1));
        assert_eq!(shape_output(&Value::Object(obj.clone())), obj);
    }

    #[test]
    fn panicking_process_inputs_falls_back_to_raw() {
        let mut raw = Map::new();
        raw.insert("a".into(), Value::from(1));
        let bad: ProcessInputs = Arc::new(|_m: Map<String, Value>| -> Map<String, Value> {
            panic!("boom")
        });
        let result = apply_process_inputs(Some(&bad), raw.clone());
        assert_eq!(result, raw);
    }

    #[tokio::test]
    async fn deferred_inputs_records_resolved_future_value() {
        let deferred = DeferredInputs::new();
        let value = deferred.wrap_future("x", async { 42i64 }).await;
        assert_eq!(value, 42);
        assert_eq!(deferred.resolved().get("x"), Some(&Value::from(42)));
    }
}
