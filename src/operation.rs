//! Wire-facing operation and run-snapshot types shared between the run
//! model and the dispatcher.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::RunId;
use crate::run::{Event, RunStatus};

/// An additional destination a run should be mirrored to. A replica
/// may target a different project within the same backend, or a
/// wholly different endpoint/workspace/key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Replica {
    pub project: Option<String>,
    pub reference_example_id: Option<RunId>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub workspace_id: Option<String>,
}

/// The JSON summary of a run as it goes out over the wire, plus the
/// bulky fields framed alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub trace_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub dotted_order: String,
    pub name: String,
    pub run_type: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: RunStatus,
    pub inputs: Map<String, Value>,
    pub outputs: Option<Map<String, Value>>,
    pub error: Option<String>,
    pub extra: Map<String, Value>,
    pub events: Vec<Event>,
    pub tags: Vec<String>,
    pub reference_example_id: Option<RunId>,
    pub project_name: Option<String>,
    pub session_name: Option<String>,
}

/// Whether an [`Operation`] is a create or an update, carrying the
/// update-only `exclude_inputs` flag from `patchRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update { exclude_inputs: bool },
}

/// One dispatcher-facing unit of work: a run snapshot plus any
/// attachments, tagged with its operation kind and, when the run
/// requested fan-out, the replica destinations it should be mirrored to.
///
/// `replicas` is expanded by the dispatcher at enqueue time (see
/// `dispatcher::Dispatcher::enqueue`) into one physical operation per
/// destination, each with freshly minted, replica-local ids, so that
/// replicated runs never collide with the primary destination's ids.
/// Only the dispatcher sees the whole trace's id remap cache, which is
/// why the remapping happens there rather than in `Run`.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub run: RunSnapshot,
    pub attachments: HashMap<String, (String, Bytes)>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub workspace_id: Option<String>,
    pub replicas: Vec<Replica>,
}

/// Anything that can accept dispatcher-facing operations from a [`Run`](crate::run::Run).
/// Implemented by [`crate::dispatcher::Dispatcher`]; kept as a trait so
/// run construction never depends on the dispatcher's concrete type.
pub trait RunSink: Send + Sync {
    fn enqueue(&self, op: Operation);
}
