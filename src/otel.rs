//! OTEL interop (optional adjunct): a deterministic, documented mapping
//! from a [`RunId`] to an OTEL trace id and span id, so ids survive a
//! process restart for the same run (spec.md §4.7 "OTEL interop", §9
//! "OTEL id bridging"). Gated behind the `otel` feature — this crate's
//! core never depends on `opentelemetry` otherwise.
//!
//! Truncating after hashing (rather than slicing the run id's bits
//! directly) avoids biasing the derived span id toward the run id's
//! own time-ordered high bits, per Design Notes' explicit warning
//! against naive slicing.

use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::KeyValue;
use sha2::{Digest, Sha256};

use crate::ids::RunId;
use crate::operation::RunSnapshot;

fn digest(id: RunId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(id.as_u128().to_be_bytes());
    hasher.finalize().into()
}

/// Derives a 128-bit OTEL trace id from a run id: the first 16 bytes of
/// `SHA256(run_id)`. Stable across process restarts for the same id.
pub fn run_id_to_trace_id(id: RunId) -> TraceId {
    let d = digest(id);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&d[..16]);
    TraceId::from_bytes(bytes)
}

/// Derives a 64-bit OTEL span id from a run id: bytes 16..24 of
/// `SHA256(run_id)` — a disjoint slice of the same digest used for the
/// trace id, so the two never trivially collide with each other.
pub fn run_id_to_span_id(id: RunId) -> SpanId {
    let d = digest(id);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&d[16..24]);
    SpanId::from_bytes(bytes)
}

/// Builds the GenAI-semantic-convention-flavored attribute set for a
/// span mirroring `run`'s key fields.
pub fn run_attributes(run: &RunSnapshot) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("gen_ai.operation.name", run.run_type.clone()),
        KeyValue::new("run.id", run.id.to_string()),
        KeyValue::new("run.trace_id", run.trace_id.to_string()),
        KeyValue::new("run.name", run.name.clone()),
        KeyValue::new("run.dotted_order", run.dotted_order.clone()),
    ];
    if let Some(project) = &run.project_name {
        attrs.push(KeyValue::new("run.project", project.clone()));
    }
    if let Some(parent) = run.parent_run_id {
        attrs.push(KeyValue::new("run.parent_run_id", parent.to_string()));
    }
    attrs
}
