//! The traceable-function wrapper (C7): instrumentation around
//! arbitrary callables, including streaming ones.
//!
//! spec.md's "whatever was returned" polymorphism has no sound runtime
//! duck-typing equivalent in safe Rust, so per Design Notes §9 the five
//! return shapes are exposed as distinct, explicitly named entry points
//! instead of one dynamically-dispatching wrapper: [`trace_call`] (shape
//! 1, and shape 5's error path folded into its `Result`),
//! [`trace_stream`] (shape 2), [`trace_iter`] (shape 3),
//! [`trace_object_stream`] (shape 4). All four share the same
//! `TraceConfig`/parent-resolution/input-capture machinery through
//! [`start_child`].

pub mod inputs;
pub mod usage;

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_core::Stream;
use futures_util::FutureExt as _;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::context::{ContextSnapshot, CurrentRun};
use crate::ids::RunId;
use crate::operation::{Replica, RunSink};
use crate::run::{Run, RunConfig, RunType};

pub use inputs::{shape_inputs, shape_output, Attachment, DeferredInputs, ExtractAttachments, ProcessInputs};

/// How the child run's parent is selected for one call, per spec.md
/// §4.7 "Parent selection": an explicit leading argument, a forced-root
/// sentinel, or (the default) whatever the ambient context holds.
pub enum ParentRef {
    /// An explicit parent run, supplied as the call's leading argument.
    Explicit(Run),
    /// The "root sentinel": forces a new tree even if a parent is
    /// ambiently current.
    Root,
    /// Consult [`CurrentRun::get`]; a root if nothing is current.
    Ambient,
}

impl ParentRef {
    fn resolve(self) -> Option<Run> {
        match self {
            ParentRef::Explicit(run) => Some(run),
            ParentRef::Root => None,
            ParentRef::Ambient => CurrentRun::get(),
        }
    }
}

/// The static, call-site configuration for a wrapped function — the
/// Rust analogue of spec.md's `config` argument to the higher-order
/// traceable wrapper. Built once (typically alongside the function it
/// instruments) and cloned cheaply per call.
#[derive(Clone)]
pub struct TraceConfig {
    pub name: String,
    pub run_type: RunType,
    pub project_name: Option<String>,
    pub tags: Vec<String>,
    pub reference_example_id: Option<RunId>,
    pub replicas: Vec<Replica>,
    pub sink: Option<Arc<dyn RunSink>>,
    pub process_inputs: Option<ProcessInputs>,
    pub extract_attachments: Option<ExtractAttachments>,
    /// `tracingEnabled`: when false, every entry point below becomes an
    /// identity wrapper that still preserves ambient context (spec.md §6).
    pub tracing_enabled: bool,
}

impl TraceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_type: RunType::default(),
            project_name: None,
            tags: Vec::new(),
            reference_example_id: None,
            replicas: Vec::new(),
            sink: None,
            process_inputs: None,
            extract_attachments: None,
            tracing_enabled: true,
        }
    }

    pub fn run_type(mut self, run_type: RunType) -> Self {
        self.run_type = run_type;
        self
    }

    pub fn project_name(mut self, project: impl Into<String>) -> Self {
        self.project_name = Some(project.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn reference_example_id(mut self, id: RunId) -> Self {
        self.reference_example_id = Some(id);
        self
    }

    pub fn replicas(mut self, replicas: Vec<Replica>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn process_inputs(mut self, f: ProcessInputs) -> Self {
        self.process_inputs = Some(f);
        self
    }

    pub fn extract_attachments(mut self, f: ExtractAttachments) -> Self {
        self.extract_attachments = Some(f);
        self
    }

    pub fn tracing_enabled(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }
}

/// Shapes a call's raw arguments into the captured input mapping and any
/// extracted attachments, applying `extractAttachments` before shaping
/// and `processInputs` after — spec.md §4.7 "Input capture" / "Attachment
/// extraction", in that order.
pub fn prepare_call(cfg: &TraceConfig, args: Vec<Value>) -> (Map<String, Value>, Vec<Attachment>) {
    let (attachments, remaining) = match &cfg.extract_attachments {
        Some(f) => f(args),
        None => (Vec::new(), args),
    };
    let raw = shape_inputs(remaining);
    let shaped = inputs::apply_process_inputs(cfg.process_inputs.as_ref(), raw);
    (shaped, attachments)
}

fn register_attachments(run: &Run, attachments: Vec<Attachment>) {
    for (name, mime_type, bytes) in attachments {
        run.add_attachment(name, mime_type, bytes);
    }
}

/// Creates the child run for one call: resolves the parent per
/// [`ParentRef`], then either extends it (`create_child`) or builds a
/// fresh root, carrying every static field `cfg` supplies.
fn start_child(cfg: &TraceConfig, parent: ParentRef, inputs: Map<String, Value>) -> Run {
    let mut rc = RunConfig::new(cfg.name.clone())
        .run_type(cfg.run_type.clone())
        .inputs(inputs)
        .tags(cfg.tags.clone());
    if let Some(project) = &cfg.project_name {
        rc = rc.project_name(project.clone());
    }
    if let Some(sink) = &cfg.sink {
        rc = rc.sink(sink.clone());
    }
    if let Some(reference) = cfg.reference_example_id {
        rc = rc.reference_example_id(reference);
    }
    if !cfg.replicas.is_empty() {
        rc = rc.replicas(cfg.replicas.clone());
    }
    match parent.resolve() {
        Some(parent_run) => parent_run.create_child(rc),
        None => rc.build(),
    }
}

/// Shape 1: a plain value, or a future resolving to one. Also folds in
/// shape 5 (error): `fut`'s `Err` path ends the run with the error and
/// is never waited on for the child-promise fence ("fail fast").
///
/// When `cfg.tracing_enabled` is false this is an identity wrapper: it
/// still runs `fut` under whatever ambient context is already current,
/// but mints no run and talks to no dispatcher.
pub async fn trace_call<Fut, O, E>(
    cfg: TraceConfig,
    parent: ParentRef,
    inputs: Map<String, Value>,
    attachments: Vec<Attachment>,
    fut: Fut,
) -> Result<O, E>
where
    Fut: std::future::Future<Output = Result<O, E>>,
    O: Serialize,
    E: std::fmt::Display,
{
    if !cfg.tracing_enabled {
        return CurrentRun::enter(CurrentRun::get(), fut).await;
    }

    let run = start_child(&cfg, parent, inputs);
    register_attachments(&run, attachments);
    run.post_run();

    let outcome = CurrentRun::enter(Some(run.clone()), AssertUnwindSafe(fut).catch_unwind()).await;
    let result = match outcome {
        Ok(Ok(value)) => {
            run.await_pending_children().await;
            let outputs = shape_output(&serde_json::to_value(&value).unwrap_or(Value::Null));
            usage::apply_usage_metadata(&run, &outputs);
            run.end(Some(outputs), None, None);
            Ok(value)
        }
        Ok(Err(e)) => {
            // Fail fast: the child-promise fence is only awaited on the
            // success path, per spec.md §4.7.
            run.end(None, Some(format!("Error: {e}")), None);
            Err(e)
        }
        Err(panic_payload) => {
            // A panic inside `fut` still ends the run, with the panic
            // message recorded as its error, before being re-raised —
            // `trace_call` is the only boundary that catches unwinds
            // (spec.md §4.7); everything above it sees a normal panic.
            run.end(None, Some(format!("Error: {}", panic_message(&panic_payload))), None);
            run.patch_run(true);
            std::panic::resume_unwind(panic_payload);
        }
    };
    run.patch_run(true);
    result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Variant of [`trace_call`] for deferred inputs (spec.md §4.7 "Deferred
/// inputs"): when one of the call's original arguments was itself a
/// stream or future, `inputs` cannot be materialized until `fut` has
/// consumed it. No `create` is dispatched until `fut` completes — the
/// caller passes a [`DeferredInputs`] that the wrapped argument's proxy
/// populated during the call.
pub async fn trace_call_deferred<Fut, O, E>(
    cfg: TraceConfig,
    parent: ParentRef,
    deferred: DeferredInputs,
    attachments: Vec<Attachment>,
    fut: Fut,
) -> Result<O, E>
where
    Fut: std::future::Future<Output = Result<O, E>>,
    O: Serialize,
    E: std::fmt::Display,
{
    if !cfg.tracing_enabled {
        return CurrentRun::enter(CurrentRun::get(), fut).await;
    }

    let run = start_child(&cfg, parent, Map::new());
    register_attachments(&run, attachments);

    let result = CurrentRun::enter(Some(run.clone()), fut).await;
    run.set_inputs(deferred.resolved());
    match &result {
        Ok(value) => {
            run.await_pending_children().await;
            let outputs = shape_output(&serde_json::to_value(value).unwrap_or(Value::Null));
            usage::apply_usage_metadata(&run, &outputs);
            run.end(Some(outputs), None, None);
        }
        Err(e) => {
            run.end(None, Some(format!("Error: {e}")), None);
        }
    }
    // First dispatcher operation is the `create`, issued only now.
    run.post_run();
    result
}

/// Aggregates a sequence of streamed chunk values into `outputs`: the
/// user-supplied aggregator's result if one was given, else the raw
/// chunk list under `{outputs: [...]}}`.
fn aggregate_chunks(chunks: Vec<Value>, aggregator: Option<&(dyn Fn(Vec<Value>) -> Value + Send + Sync)>) -> Map<String, Value> {
    match aggregator {
        Some(f) => shape_output(&f(chunks)),
        None => {
            let mut m = Map::new();
            m.insert("outputs".to_string(), Value::Array(chunks));
            m
        }
    }
}

/// A boxed, thread-safe aggregator reducing streamed chunks to a single
/// `outputs` value.
pub type Aggregator = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// Shape 2: a tapping wrapper around any `Stream`, produced by
/// [`trace_stream`]. Forwards every item to the consumer, records it for
/// later aggregation, and (for `run_type == "llm"`) emits a `new_token`
/// event per item. Ends the run on exhaustion; ends it with
/// `error = "Cancelled"` if dropped before exhaustion (the Rust-native
/// reading of "consumer abandons iteration" — there is no separate
/// cancellation callback to hook, `Drop::drop` on the tap *is* that path).
pub struct TracedStream<S, T> {
    inner: S,
    run: Option<Run>,
    context: ContextSnapshot,
    chunks: Vec<Value>,
    aggregator: Option<Aggregator>,
    is_llm: bool,
    ended: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<S, T> TracedStream<S, T>
where
    S: Stream<Item = T> + Unpin,
    T: Serialize,
{
    fn finish(&mut self, error: Option<String>) {
        let Some(run) = self.run.take() else { return };
        let chunks = std::mem::take(&mut self.chunks);
        let outputs = aggregate_chunks(chunks, self.aggregator.as_deref());
        usage::apply_usage_metadata(&run, &outputs);
        run.end(Some(outputs), error, None);
        run.patch_run(true);
        self.ended = true;
    }
}

impl<S, T> Stream for TracedStream<S, T>
where
    S: Stream<Item = T> + Unpin,
    T: Serialize,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        let context = this.context.clone();
        let inner = &mut this.inner;
        let polled = context.enter_blocking(|| Pin::new(inner).poll_next(cx));
        match polled {
            Poll::Ready(Some(item)) => {
                this.chunks
                    .push(serde_json::to_value(&item).unwrap_or(Value::Null));
                if this.is_llm {
                    if let Some(run) = &this.run {
                        run.add_event("new_token", None);
                    }
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S, T> Drop for TracedStream<S, T> {
    fn drop(&mut self) {
        let Some(run) = self.run.take() else { return };
        // Dropped before exhaustion: the consumer abandoned iteration.
        let chunks = std::mem::take(&mut self.chunks);
        let outputs = aggregate_chunks(chunks, self.aggregator.as_deref());
        run.end(Some(outputs), Some("Cancelled".to_string()), None);
        run.patch_run(true);
    }
}

/// Wraps `stream` as a child run. The run is created (`post_run`)
/// immediately, matching spec.md's non-deferred case: none of this
/// function's own arguments are themselves streams/futures being
/// proxied, so there is nothing to defer.
pub fn trace_stream<S, T>(
    cfg: TraceConfig,
    parent: ParentRef,
    inputs: Map<String, Value>,
    attachments: Vec<Attachment>,
    stream: S,
    aggregator: Option<Aggregator>,
) -> TracedStream<S, T>
where
    S: Stream<Item = T> + Unpin,
    T: Serialize,
{
    let is_llm = cfg.run_type == RunType::Llm;
    let run = start_child(&cfg, parent, inputs);
    register_attachments(&run, attachments);
    run.post_run();
    TracedStream {
        inner: stream,
        context: CurrentRun::snapshot(),
        run: Some(run),
        chunks: Vec::new(),
        aggregator,
        is_llm,
        ended: false,
        _marker: std::marker::PhantomData,
    }
}

/// Shape 3: a sync generator/iterator. spec.md requires *eager*
/// draining (to preserve ambient-context ordering with whatever runs
/// synchronously after the call), so this fully drains `iter` under the
/// child's context before returning a fresh iterator over the buffered
/// values.
pub fn trace_iter<I, T>(
    cfg: TraceConfig,
    parent: ParentRef,
    inputs: Map<String, Value>,
    attachments: Vec<Attachment>,
    iter: I,
    aggregator: Option<Aggregator>,
) -> std::vec::IntoIter<T>
where
    I: Iterator<Item = T>,
    T: Serialize,
{
    if !cfg.tracing_enabled {
        return iter.collect::<Vec<_>>().into_iter();
    }
    let is_llm = cfg.run_type == RunType::Llm;
    let run = start_child(&cfg, parent, inputs);
    register_attachments(&run, attachments);
    run.post_run();

    let guard = CurrentRun::enter_sync(Some(run.clone()));
    let mut buffer = Vec::new();
    let mut chunks = Vec::new();
    for item in iter {
        chunks.push(serde_json::to_value(&item).unwrap_or(Value::Null));
        if is_llm {
            run.add_event("new_token", None);
        }
        buffer.push(item);
    }
    drop(guard);

    let outputs = aggregate_chunks(chunks, aggregator.as_deref());
    usage::apply_usage_metadata(&run, &outputs);
    run.end(Some(outputs), None, None);
    run.patch_run(true);
    buffer.into_iter()
}

/// Shape 4: an object carrying exactly one async-iterable property
/// (e.g. `{stream}`). `extract` pulls the streamable field out and
/// returns a closure that rebuilds the object around the tapped stream;
/// everything else about the object is left untouched.
pub fn trace_object_stream<Obj, S, T>(
    cfg: TraceConfig,
    parent: ParentRef,
    inputs: Map<String, Value>,
    attachments: Vec<Attachment>,
    obj: Obj,
    extract: impl FnOnce(Obj) -> (S, Box<dyn FnOnce(TracedStream<S, T>) -> Obj>),
    aggregator: Option<Aggregator>,
) -> Obj
where
    S: Stream<Item = T> + Unpin,
    T: Serialize,
{
    let (stream, rebuild) = extract(obj);
    let traced = trace_stream(cfg, parent, inputs, attachments, stream, aggregator);
    rebuild(traced)
}
