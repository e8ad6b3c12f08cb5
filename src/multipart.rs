//! Multipart wire framing for a batch of operations.
//!
//! Each operation is framed as a sequence of form-data parts sharing one
//! `{op_kind}.{run_id}` prefix: a `summary` part carrying everything
//! except the bulky fields, then `inputs`, `outputs`, and `events` as
//! their own parts (so the server can commit the summary before large
//! blobs arrive and parse each field as a stream), then one part per
//! attachment. Part order within an operation is stable — summary,
//! inputs, outputs, events, attachments — matching spec.md §4.6 exactly.

use bytes::{BufMut, BytesMut};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::operation::Operation;

const BOUNDARY_PREFIX: &str = "ob-trace-boundary-";

fn random_boundary() -> String {
    let suffix: String = (0..24)
        .map(|_| {
            let n = rand::thread_rng().gen_range(0..62);
            match n {
                0..=9 => (b'0' + n) as char,
                10..=35 => (b'a' + (n - 10)) as char,
                _ => (b'A' + (n - 36)) as char,
            }
        })
        .collect();
    format!("{BOUNDARY_PREFIX}{suffix}")
}

/// Everything in a [`crate::operation::RunSnapshot`] except `inputs`,
/// `outputs`, and `events` — those get their own parts so the server can
/// commit this summary before the bulky fields arrive.
#[derive(Serialize)]
struct RunSummaryView<'a> {
    id: &'a crate::ids::RunId,
    trace_id: &'a crate::ids::RunId,
    parent_run_id: &'a Option<crate::ids::RunId>,
    dotted_order: &'a str,
    name: &'a str,
    run_type: &'a str,
    start_time: i64,
    end_time: Option<i64>,
    status: crate::run::RunStatus,
    error: &'a Option<String>,
    extra: &'a Map<String, Value>,
    tags: &'a [String],
    reference_example_id: &'a Option<crate::ids::RunId>,
    project_name: &'a Option<String>,
    session_name: &'a Option<String>,
}

/// Accumulates operations into one multipart/form-data body.
pub struct MultipartWriter {
    boundary: String,
    body: BytesMut,
}

impl MultipartWriter {
    pub fn new() -> Self {
        Self {
            boundary: random_boundary(),
            body: BytesMut::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn write_part(&mut self, name: &str, content_type: &str, data: &[u8]) {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"\r\n");
        self.body.put_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n").as_bytes(),
        );
        self.body
            .put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        self.body.put_slice(data);
        self.body.put_slice(b"\r\n");
    }

    /// Frames one operation's summary, inputs, outputs, events, and
    /// attachment parts, in that stable order.
    pub fn write_operation(&mut self, op: &Operation) -> crate::error::Result<()> {
        let kind = match op.kind {
            crate::operation::OpKind::Create => "post",
            crate::operation::OpKind::Update { .. } => "patch",
        };
        let prefix = format!("{kind}.{}", op.run.id);
        let run = &op.run;

        let summary = RunSummaryView {
            id: &run.id,
            trace_id: &run.trace_id,
            parent_run_id: &run.parent_run_id,
            dotted_order: &run.dotted_order,
            name: &run.name,
            run_type: &run.run_type,
            start_time: run.start_time,
            end_time: run.end_time,
            status: run.status,
            error: &run.error,
            extra: &run.extra,
            tags: &run.tags,
            reference_example_id: &run.reference_example_id,
            project_name: &run.project_name,
            session_name: &run.session_name,
        };
        self.write_part(&prefix, "application/json", &serde_json::to_vec(&summary)?);

        if !run.inputs.is_empty() {
            let part_name = format!("{prefix}.inputs");
            self.write_part(&part_name, "application/json", &serde_json::to_vec(&run.inputs)?);
        }
        if let Some(outputs) = &run.outputs {
            let part_name = format!("{prefix}.outputs");
            self.write_part(&part_name, "application/json", &serde_json::to_vec(outputs)?);
        }
        if !run.events.is_empty() {
            let part_name = format!("{prefix}.events");
            self.write_part(&part_name, "application/json", &serde_json::to_vec(&run.events)?);
        }

        let mut names: Vec<&String> = op.attachments.keys().collect();
        names.sort();
        for name in names {
            let (mime_type, bytes) = &op.attachments[name];
            let part_name = format!("{prefix}.attachment.{name}");
            self.write_part(&part_name, mime_type, bytes);
        }
        Ok(())
    }

    /// Finalizes the body with the closing boundary marker, consuming
    /// `self`.
    pub fn finish(mut self) -> BytesMut {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"--\r\n");
        self.body
    }
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}
