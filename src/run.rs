//! The run-tree model: runs, their lifecycle, and the invariants
//! tying parent and child together.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{self, RunId};
use crate::operation::{OpKind, Operation, Replica, RunSink, RunSnapshot};
use crate::registry;

pub(crate) fn now_millis_i64() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// One of the well-known run types, with an open `Other` fallback for
/// unrecognized values: the set is open, unknown values are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunType {
    Chain,
    Llm,
    Tool,
    Retriever,
    Prompt,
    Parser,
    Embedding,
    Other(String),
}

impl RunType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chain => "chain",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Retriever => "retriever",
            Self::Prompt => "prompt",
            Self::Parser => "parser",
            Self::Embedding => "embedding",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for RunType {
    fn from(s: &str) -> Self {
        match s {
            "chain" => Self::Chain,
            "llm" => Self::Llm,
            "tool" => Self::Tool,
            "retriever" => Self::Retriever,
            "prompt" => Self::Prompt,
            "parser" => Self::Parser,
            "embedding" => Self::Embedding,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Default for RunType {
    fn default() -> Self {
        Self::Chain
    }
}

/// Derived run status: never stored, always computed from state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Success,
    Error,
}

/// One entry in a run's append-only event log (e.g. a streamed token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
}

/// Mutable fields of a run, behind one lock so lifecycle operations
/// (`end`, `add_event`, attachment registration) are atomic with
/// respect to each other and to `snapshot`/`post_run`/`patch_run`.
struct MutableState {
    end_time: Option<i64>,
    inputs: Map<String, Value>,
    outputs: Option<Map<String, Value>>,
    error: Option<String>,
    extra: Map<String, Value>,
    events: Vec<Event>,
    attachments: HashMap<String, (String, Bytes)>,
    /// Handles of background tasks registered via
    /// [`Run::register_child_handle`] — the child-promise fence a
    /// traceable wrapper's success path awaits before recording
    /// outputs, so aggregator logic sees every descendant that was
    /// spawned concurrently rather than awaited inline.
    pending_children: Vec<tokio::task::JoinHandle<()>>,
}

/// The heap-allocated, shared body of a [`Run`]. Never constructed
/// directly — use [`RunConfig::build`] or [`Run::create_child`].
pub struct RunInner {
    id: RunId,
    trace_id: RunId,
    parent_run_id: Option<RunId>,
    parent: Option<Run>,
    dotted_order: String,
    name: String,
    run_type: RunType,
    start_time: i64,
    project_name: Option<String>,
    session_name: Option<String>,
    tags: Vec<String>,
    reference_example_id: Option<RunId>,
    replicas: Vec<Replica>,
    sink: Option<Arc<dyn RunSink>>,
    execution_order: u32,
    child_execution_order: AtomicU32,
    ended: AtomicBool,
    state: Mutex<MutableState>,
}

/// A handle to a run node. Cheap to clone (an `Arc` bump); clones refer
/// to the same underlying run.
#[derive(Clone)]
pub struct Run(Arc<RunInner>);

/// Builder for a new run. Construct with
/// [`RunConfig::new`], customize with the setter methods, then call
/// [`RunConfig::build`] for a root run or [`Run::create_child`] to
/// attach it under a parent.
#[derive(Default)]
pub struct RunConfig {
    pub(crate) name: String,
    pub(crate) run_type: RunType,
    pub(crate) parent: Option<Run>,
    pub(crate) id: Option<RunId>,
    pub(crate) start_time: Option<i64>,
    pub(crate) project_name: Option<String>,
    pub(crate) session_name: Option<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) inputs: Map<String, Value>,
    pub(crate) replicas: Vec<Replica>,
    pub(crate) reference_example_id: Option<RunId>,
    pub(crate) sink: Option<Arc<dyn RunSink>>,
    /// Overrides the computed execution order. Only meant to be set by
    /// `Run::create_child`, or by propagation reconstructing a
    /// synthetic parent at a known tree position.
    pub(crate) execution_order: Option<u32>,
    /// Overrides trace_id (propagation's synthetic parent needs this
    /// instead of defaulting to its own id).
    pub(crate) trace_id: Option<RunId>,
    /// Overrides parent_run_id directly without an in-process parent
    /// `Run` (propagation's synthetic parent has no real parent).
    pub(crate) parent_run_id: Option<RunId>,
    /// Overrides the dotted-order prefix this run extends, bypassing
    /// `parent`'s own dotted_order (propagation again).
    pub(crate) dotted_order_prefix: Option<String>,
    /// Supplies the run's dotted-order string verbatim, skipping segment
    /// construction entirely. Used only by [`crate::propagation::from_headers`]
    /// to rebuild a synthetic parent whose dotted-order is exactly the
    /// string received over the wire.
    pub(crate) precomputed_dotted_order: Option<String>,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_type: RunType::default(),
            ..Default::default()
        }
    }

    pub fn run_type(mut self, run_type: RunType) -> Self {
        self.run_type = run_type;
        self
    }

    pub fn parent(mut self, parent: Run) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(mut self, id: RunId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn start_time(mut self, epoch_ms: i64) -> Self {
        self.start_time = Some(epoch_ms);
        self
    }

    pub fn project_name(mut self, project: impl Into<String>) -> Self {
        self.project_name = Some(project.into());
        self
    }

    pub fn session_name(mut self, session: impl Into<String>) -> Self {
        self.session_name = Some(session.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        let mut set: HashSet<String> = tags.into_iter().collect();
        self.tags = set.drain().collect();
        self
    }

    pub fn inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn replicas(mut self, replicas: Vec<Replica>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn reference_example_id(mut self, id: RunId) -> Self {
        self.reference_example_id = Some(id);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Used by [`crate::propagation::from_headers`] to seed a synthetic
    /// parent at the exact tree position a remote trace header implies.
    pub fn synthetic_position(
        mut self,
        trace_id: RunId,
        parent_run_id: Option<RunId>,
        dotted_order_prefix: String,
        execution_order: u32,
    ) -> Self {
        self.trace_id = Some(trace_id);
        self.parent_run_id = parent_run_id;
        self.dotted_order_prefix = Some(dotted_order_prefix);
        self.execution_order = Some(execution_order);
        self
    }

    /// Rebuilds a synthetic run at an exact, already-known tree
    /// position: the run's own `id`, `trace_id`, `parent_run_id`,
    /// `start_time`, and `dotted_order` are all supplied verbatim
    /// instead of computed, because they were decoded from an incoming
    /// propagation header rather than minted locally.
    pub fn synthetic_from_wire(
        mut self,
        id: RunId,
        trace_id: RunId,
        parent_run_id: Option<RunId>,
        start_time: i64,
        dotted_order: String,
    ) -> Self {
        self.id = Some(id);
        self.trace_id = Some(trace_id);
        self.parent_run_id = parent_run_id;
        self.start_time = Some(start_time);
        self.precomputed_dotted_order = Some(dotted_order);
        self
    }

    /// Builds a root run, or a run at an explicitly supplied synthetic
    /// position. Prefer [`Run::create_child`] for ordinary nested runs
    /// so parent/child bookkeeping (`trace_id`, `dotted_order`,
    /// execution order propagation) is handled automatically.
    pub fn build(self) -> Run {
        let exec_order = self.execution_order.unwrap_or(1);
        build_run(self, exec_order)
    }
}

fn build_run(cfg: RunConfig, exec_order: u32) -> Run {
    let start_time = cfg.start_time.unwrap_or_else(now_millis_i64);
    let id = cfg.id.unwrap_or_else(RunId::new);
    if !id.is_time_ordered() {
        tracing::warn!(
            run_id = %id,
            "externally supplied run id is not time-ordered; dotted-order ordering guarantees weaken"
        );
    }

    if let Some(dotted_order) = cfg.precomputed_dotted_order.clone() {
        let inner = Arc::new(RunInner {
            id,
            trace_id: cfg.trace_id.unwrap_or(id),
            parent_run_id: cfg.parent_run_id,
            parent: cfg.parent,
            dotted_order,
            name: cfg.name,
            run_type: cfg.run_type,
            start_time,
            project_name: cfg.project_name,
            session_name: cfg.session_name,
            tags: cfg.tags,
            reference_example_id: cfg.reference_example_id,
            replicas: cfg.replicas,
            sink: cfg.sink,
            execution_order: exec_order,
            child_execution_order: AtomicU32::new(exec_order),
            ended: AtomicBool::new(false),
            state: Mutex::new(MutableState {
                end_time: None,
                inputs: cfg.inputs,
                outputs: None,
                error: None,
                extra: Map::new(),
                events: Vec::new(),
                attachments: HashMap::new(),
                pending_children: Vec::new(),
            }),
        });
        registry::register(id, &inner);
        return Run(inner);
    }

    let own_segment = ids::Segment::new(start_time, exec_order, id);

    let (trace_id, parent_run_id, dotted_order) = if let Some(parent) = &cfg.parent {
        let parent_segments = ids::split_segments(&parent.0.dotted_order)
            .expect("a run's own dotted_order is always well-formed");
        let dotted = ids::join_segments(&parent_segments, &own_segment);
        let dotted = ids::fix(&dotted).expect("freshly joined dotted_order is always well-formed");
        (parent.0.trace_id, Some(parent.0.id), dotted)
    } else if let Some(prefix) = &cfg.dotted_order_prefix {
        let prefix_segments = ids::split_segments(prefix).unwrap_or_default();
        let dotted = ids::join_segments(&prefix_segments, &own_segment);
        let dotted = ids::fix(&dotted).expect("freshly joined dotted_order is always well-formed");
        (cfg.trace_id.unwrap_or(id), cfg.parent_run_id, dotted)
    } else {
        let dotted = ids::join_segments(&[], &own_segment);
        (cfg.trace_id.unwrap_or(id), None, dotted)
    };

    let is_fresh_root = cfg.parent.is_none() && cfg.dotted_order_prefix.is_none();

    let inner = Arc::new(RunInner {
        id,
        trace_id,
        parent_run_id,
        parent: cfg.parent,
        dotted_order,
        name: cfg.name,
        run_type: cfg.run_type,
        start_time,
        project_name: cfg.project_name,
        session_name: cfg.session_name,
        tags: cfg.tags,
        reference_example_id: cfg.reference_example_id,
        replicas: cfg.replicas,
        sink: cfg.sink,
        execution_order: exec_order,
        child_execution_order: AtomicU32::new(exec_order),
        ended: AtomicBool::new(false),
        state: Mutex::new(MutableState {
            end_time: None,
            inputs: cfg.inputs,
            outputs: None,
            error: None,
            extra: Map::new(),
            events: Vec::new(),
            attachments: HashMap::new(),
            pending_children: Vec::new(),
        }),
    });

    registry::register(id, &inner);
    let run = Run(inner);
    if is_fresh_root {
        stamp_root_environment(&run);
    }
    run
}

/// Stamps a freshly minted root run with the one-time process
/// environment fingerprint (`extra.metadata.runtime`) plus any
/// recognized `OB_TRACE_*` metadata toggles — mirrors the teacher's
/// habit of attaching environment context once at the top of a unit of
/// work rather than on every descendant.
fn stamp_root_environment(run: &Run) {
    let info = crate::env_probe::runtime_info();
    if let Ok(value) = serde_json::to_value(info) {
        run.merge_metadata("runtime", value);
    }
    if let Some(revision) = crate::env_probe::revision_metadata() {
        if let Some(id) = revision.get("revision_id") {
            run.merge_metadata("revision_id", id.clone());
        }
    }
    if let Some(tracking) = crate::env_probe::test_tracking_metadata() {
        if let Some(enabled) = tracking.get("test_tracking") {
            run.merge_metadata("test_tracking", enabled.clone());
        }
    }
}

/// Raises every ancestor's `child_execution_order` to at least `value`,
/// starting from `start` (exclusive of the run that triggered the
/// bump — callers pass the triggering run's own parent). Guards against
/// cycles with a visited set.
fn bump_ancestors(start: Option<Run>, value: u32) {
    let mut visited = HashSet::new();
    let mut current = start;
    while let Some(run) = current {
        if !visited.insert(run.0.id) {
            break;
        }
        loop {
            let cur = run.0.child_execution_order.load(Ordering::SeqCst);
            if cur >= value {
                break;
            }
            if run
                .0
                .child_execution_order
                .compare_exchange_weak(cur, value, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        current = run.0.parent.clone();
    }
}

impl Run {
    pub fn id(&self) -> RunId {
        self.0.id
    }

    pub fn trace_id(&self) -> RunId {
        self.0.trace_id
    }

    pub fn parent_run_id(&self) -> Option<RunId> {
        self.0.parent_run_id
    }

    pub fn dotted_order(&self) -> &str {
        &self.0.dotted_order
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn run_type(&self) -> &RunType {
        &self.0.run_type
    }

    pub fn start_time(&self) -> i64 {
        self.0.start_time
    }

    pub fn project_name(&self) -> Option<&str> {
        self.0.project_name.as_deref()
    }

    /// Derived status: `pending` with no `end_time`, `success` once
    /// ended without an error, `error` once ended with one.
    pub fn status(&self) -> RunStatus {
        let state = self.0.state.lock().expect("run state poisoned");
        status_from_state(&state)
    }

    /// Creates a child run under `self`, propagating `project_name`,
    /// `replicas`, and the dispatcher sink by default, and
    /// maintaining the global execution-order invariant across the
    /// whole ancestor chain.
    pub fn create_child(&self, mut cfg: RunConfig) -> Run {
        if cfg.project_name.is_none() {
            cfg.project_name = self.0.project_name.clone();
        }
        if cfg.replicas.is_empty() {
            cfg.replicas = self.0.replicas.clone();
        }
        if cfg.sink.is_none() {
            cfg.sink = self.0.sink.clone();
        }
        cfg.parent = Some(self.clone());

        let new_value = self.0.child_execution_order.fetch_add(1, Ordering::SeqCst) + 1;
        let child = build_run(cfg, new_value);
        bump_ancestors(self.0.parent.clone(), new_value);
        child
    }

    /// Ends the run. At-most-once: a second call (whether from user
    /// code or library glue) is a no-op on already-set fields, logged
    /// at debug: the first call to actually set the end time wins.
    pub fn end(
        &self,
        outputs: Option<Map<String, Value>>,
        error: Option<String>,
        end_time: Option<i64>,
    ) {
        if self.0.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!(run_id = %self.0.id, "run already ended; ignoring duplicate end()");
            return;
        }
        let mut state = self.0.state.lock().expect("run state poisoned");
        state.end_time = Some(end_time.unwrap_or_else(now_millis_i64));
        if let Some(o) = outputs {
            state.outputs = Some(o);
        }
        if let Some(e) = error {
            state.error = Some(e);
        }
    }

    /// Appends an event (e.g. a streamed token). Append-only.
    pub fn add_event(&self, name: impl Into<String>, kwargs: Option<Map<String, Value>>) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        state.events.push(Event {
            name: name.into(),
            time: now_millis_i64(),
            kwargs,
        });
    }

    /// Registers a binary attachment to be carried alongside the run.
    pub fn add_attachment(&self, name: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        state.attachments.insert(name.into(), (mime_type.into(), bytes));
    }

    /// Merges additional fields into `extra` (e.g. `metadata.usage_metadata`).
    pub fn merge_extra(&self, key: impl Into<String>, value: Value) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        state.extra.insert(key.into(), value);
    }

    /// Merges one key into the nested `extra.metadata` object, creating
    /// it if absent. Used by the traceable wrapper to hoist extracted
    /// usage metadata without clobbering other `metadata` keys a caller
    /// may have already set via [`Run::merge_extra`].
    pub fn merge_metadata(&self, key: impl Into<String>, value: Value) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        let metadata = state
            .extra
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = metadata {
            map.insert(key.into(), value);
        }
    }

    /// Replaces `inputs` wholesale — used by the traceable wrapper's
    /// deferred-input path once a streamed/promised argument has been
    /// fully consumed.
    pub fn set_inputs(&self, inputs: Map<String, Value>) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        state.inputs = inputs;
    }

    /// Partially extends `outputs` without ending the run.
    pub fn extend_outputs(&self, outputs: Map<String, Value>) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        let entry = state.outputs.get_or_insert_with(Map::new);
        entry.extend(outputs);
    }

    fn snapshot_locked(&self, state: &MutableState) -> RunSnapshot {
        RunSnapshot {
            id: self.0.id,
            trace_id: self.0.trace_id,
            parent_run_id: self.0.parent_run_id,
            dotted_order: self.0.dotted_order.clone(),
            name: self.0.name.clone(),
            run_type: self.0.run_type.as_str().to_string(),
            start_time: self.0.start_time,
            end_time: state.end_time,
            status: status_from_state(state),
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            error: state.error.clone(),
            extra: state.extra.clone(),
            events: state.events.clone(),
            tags: self.0.tags.clone(),
            reference_example_id: self.0.reference_example_id,
            project_name: self.0.project_name.clone(),
            session_name: self.0.session_name.clone(),
        }
    }

    /// Takes an immutable point-in-time copy of this run, suitable for
    /// framing onto the wire.
    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.0.state.lock().expect("run state poisoned");
        self.snapshot_locked(&state)
    }

    /// Hands a `create` operation to the dispatcher sink. Errors
    /// building or enqueueing the operation are never the caller's
    /// problem: all dispatcher-facing methods swallow errors into a logger.
    pub fn post_run(&self) {
        let Some(sink) = self.0.sink.clone() else {
            return;
        };
        let state = self.0.state.lock().expect("run state poisoned");
        let run = self.snapshot_locked(&state);
        let attachments = state.attachments.clone();
        drop(state);
        sink.enqueue(Operation {
            kind: OpKind::Create,
            run,
            attachments,
            endpoint: None,
            api_key: None,
            workspace_id: None,
            replicas: self.0.replicas.clone(),
        });
    }

    /// Hands an `update` operation to the dispatcher sink. When
    /// `exclude_inputs` is set, the update omits `inputs` so an earlier
    /// create remains authoritative during the dispatcher's merge pass.
    pub fn patch_run(&self, exclude_inputs: bool) {
        let Some(sink) = self.0.sink.clone() else {
            return;
        };
        let state = self.0.state.lock().expect("run state poisoned");
        let mut run = self.snapshot_locked(&state);
        let attachments = state.attachments.clone();
        drop(state);
        if exclude_inputs {
            run.inputs = Map::new();
        }
        sink.enqueue(Operation {
            kind: OpKind::Update { exclude_inputs },
            run,
            attachments,
            endpoint: None,
            api_key: None,
            workspace_id: None,
            replicas: self.0.replicas.clone(),
        });
    }

    /// Looks up a live run anywhere in the process by id, via the
    /// weak back-edge registry.
    pub fn lookup(id: RunId) -> Option<Run> {
        registry::lookup(id).map(Run)
    }

    /// Registers a background task's join handle as part of this run's
    /// child-promise fence. A traceable wrapper's success path awaits
    /// every handle registered here before recording outputs, so
    /// concurrently spawned children (not awaited inline) are still
    /// observed by aggregator logic. Never awaited on the error path —
    /// error handling must fail fast.
    pub fn register_child_handle(&self, handle: tokio::task::JoinHandle<()>) {
        let mut state = self.0.state.lock().expect("run state poisoned");
        state.pending_children.push(handle);
    }

    /// Awaits and clears every handle registered via
    /// [`Run::register_child_handle`] since the last call. Idempotent:
    /// calling it again with nothing newly registered is a no-op.
    pub async fn await_pending_children(&self) {
        let handles = {
            let mut state = self.0.state.lock().expect("run state poisoned");
            std::mem::take(&mut state.pending_children)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::debug!(run_id = %self.0.id, error = %e, "child-fence task did not complete cleanly");
            }
        }
    }
}

fn status_from_state(state: &MutableState) -> RunStatus {
    if state.end_time.is_none() {
        RunStatus::Pending
    } else if state.error.is_some() {
        RunStatus::Error
    } else {
        RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_run_is_its_own_trace() {
        let run = RunConfig::new("root").build();
        assert_eq!(run.trace_id(), run.id());
        assert_eq!(run.parent_run_id(), None);
        assert_eq!(run.status(), RunStatus::Pending);
    }

    #[test]
    fn child_inherits_trace_id_and_extends_dotted_order() {
        let root = RunConfig::new("root").build();
        let child = root.create_child(RunConfig::new("child"));
        assert_eq!(child.trace_id(), root.id());
        assert_eq!(child.parent_run_id(), Some(root.id()));
        assert!(child.dotted_order().starts_with(root.dotted_order()));
        assert!(child.dotted_order().len() > root.dotted_order().len());
    }

    #[test]
    fn end_is_at_most_once() {
        let run = RunConfig::new("root").build();
        let mut out1 = Map::new();
        out1.insert("a".into(), Value::from(1));
        run.end(Some(out1.clone()), None, None);
        assert_eq!(run.status(), RunStatus::Success);

        let mut out2 = Map::new();
        out2.insert("a".into(), Value::from(2));
        run.end(Some(out2), Some("late error".into()), None);
        // Second call is ignored entirely: outputs and status unchanged.
        assert_eq!(run.snapshot().outputs, Some(out1));
        assert_eq!(run.status(), RunStatus::Success);
    }

    #[test]
    fn sibling_completion_raises_ancestor_child_execution_order() {
        let root = RunConfig::new("root").build();
        let mid = root.create_child(RunConfig::new("mid"));
        let _a = mid.create_child(RunConfig::new("a"));
        let _b = mid.create_child(RunConfig::new("b"));
        // root.child_execution_order must have been raised to at least
        // mid's latest child's execution order (2), even though root
        // itself only ever directly created one child ("mid").
        let root_cur = root.0.child_execution_order.load(Ordering::SeqCst);
        assert!(root_cur >= 2);
    }

    #[test]
    fn status_is_error_when_error_set() {
        let run = RunConfig::new("root").build();
        run.end(None, Some("boom".into()), None);
        assert_eq!(run.status(), RunStatus::Error);
    }

    #[test]
    fn fresh_root_is_stamped_with_runtime_metadata_but_children_are_not() {
        let root = RunConfig::new("root").build();
        let metadata = root
            .snapshot()
            .extra
            .get("metadata")
            .cloned()
            .expect("root run carries a metadata object");
        assert!(metadata.get("runtime").is_some());

        let child = root.create_child(RunConfig::new("child"));
        assert!(child.snapshot().extra.get("metadata").is_none());
    }
}
