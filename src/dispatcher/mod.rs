//! Asynchronous batching dispatcher — the only thing that actually
//! talks to the ingest backend.
//!
//! A single background flush-loop task, spawned eagerly from
//! [`Dispatcher::new`], owns the queue end-to-end: it drains batches,
//! frames them, sends them with bounded concurrency, and retries on
//! failure. This mirrors `PendingDispatchWorker`'s single-owner loop
//! (`process_pending` + `tokio::select!` against a shutdown channel)
//! rather than a pool of competing consumers, so there is never more
//! than one view of "what's in flight" to reason about.

mod retry;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, Semaphore};

use crate::config::{ClientConfig, EndpointConfig};
use crate::ids::RunId;
use crate::multipart::MultipartWriter;
use crate::operation::{OpKind, Operation, RunSink};
use crate::sampling::Sampler;

pub use retry::backoff_delay;

struct QueueState {
    queue: VecDeque<Operation>,
    /// Index into `queue` of the last-seen operation for a given run,
    /// used only during the batching pass to merge a create immediately
    /// followed by updates for the same run into one physical send.
    last_index: HashMap<RunId, usize>,
}

/// Background batching dispatcher. Implements [`RunSink`] so a [`Run`](crate::run::Run)
/// can hand it operations without knowing anything about HTTP.
pub struct Dispatcher {
    config: ClientConfig,
    http: reqwest::Client,
    sampler: Sampler,
    state: Mutex<QueueState>,
    queue_len: AtomicUsize,
    low_water_signal: Notify,
    drained_signal: Notify,
    send_permits: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    replica_remap: Mutex<HashMap<RunId, RunId>>,
}

impl Dispatcher {
    /// Builds the dispatcher and starts its background flush loop
    /// immediately — matching Design Notes' "initialized at first use,
    /// never destroyed explicitly" lifecycle, pulled forward to
    /// construction time since the dispatcher is already wrapped in an
    /// `Arc` at the point a caller could start enqueuing.
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::watch::channel(false);
        let sampler = Sampler::new(config.sampling_rate);
        let this = Arc::new(Self {
            send_permits: Arc::new(Semaphore::new(config.max_concurrency)),
            http: reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
            sampler,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                last_index: HashMap::new(),
            }),
            queue_len: AtomicUsize::new(0),
            low_water_signal: Notify::new(),
            drained_signal: Notify::new(),
            shutdown: shutdown_tx,
            replica_remap: Mutex::new(HashMap::new()),
        });
        Self::start_flush_loop(&this);
        this
    }

    fn start_flush_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = this.shutdown.subscribe();
        tokio::spawn(async move {
            tracing::info!("dispatcher flush loop started");
            loop {
                if *shutdown_rx.borrow() && this.queue_len.load(Ordering::SeqCst) == 0 {
                    break;
                }
                this.flush_one_batch().await;
                if this.queue_len.load(Ordering::SeqCst) == 0 {
                    this.drained_signal.notify_waiters();
                    tokio::select! {
                        _ = this.low_water_signal.notified() => {}
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                    }
                }
            }
            tracing::info!("dispatcher flush loop stopped");
        });
    }

    /// Drains up to `batch_size_limit` operations (merging create+update
    /// pairs for the same run), frames them, and sends them with
    /// bounded concurrency.
    async fn flush_one_batch(self: &Arc<Self>) {
        let batch = self.drain_batch().await;
        if batch.is_empty() {
            return;
        }
        let permit = match Arc::clone(&self.send_permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            this.dispatch_batch(batch).await;
        });
    }

    async fn drain_batch(self: &Arc<Self>) -> Vec<Operation> {
        let mut state = self.state.lock().await;
        let mut batch = Vec::new();
        let mut bytes_estimate = 0usize;
        while batch.len() < self.config.batch_size_limit {
            let Some(op) = state.queue.pop_front() else {
                break;
            };
            bytes_estimate += op.run.dotted_order.len() + op.run.name.len();
            for (_, (_, data)) in &op.attachments {
                bytes_estimate += data.len();
            }
            batch.push(op);
            if bytes_estimate >= self.config.batch_byte_limit {
                break;
            }
        }
        state.last_index.clear();
        self.queue_len.fetch_sub(batch.len(), Ordering::SeqCst);
        if self.queue_len.load(Ordering::SeqCst) <= self.config.queue_low_water {
            self.low_water_signal.notify_waiters();
        }
        batch
    }

    /// Expands every operation in `batch` into its fan-out destinations,
    /// groups the results by physical destination, and sends one framed
    /// request per destination.
    async fn dispatch_batch(&self, batch: Vec<Operation>) {
        let mut expanded = Vec::with_capacity(batch.len());
        for op in batch {
            expanded.extend(self.expand_replicas(op).await);
        }

        let mut explicit: HashMap<(String, Option<String>, Option<String>), Vec<Operation>> =
            HashMap::new();
        let mut default_ops: Vec<Operation> = Vec::new();
        for op in expanded {
            if let Some(endpoint) = op.endpoint.clone() {
                explicit
                    .entry((endpoint, op.api_key.clone(), op.workspace_id.clone()))
                    .or_default()
                    .push(op);
            } else {
                default_ops.push(op);
            }
        }

        if !default_ops.is_empty() {
            for (endpoint, api_key) in self.endpoint_targets() {
                self.send_to_destination(
                    &endpoint,
                    api_key.as_deref(),
                    self.config.workspace_id.as_deref(),
                    &default_ops,
                )
                .await;
            }
        }
        for ((endpoint, api_key, workspace_id), ops) in explicit {
            self.send_to_destination(&endpoint, api_key.as_deref(), workspace_id.as_deref(), &ops)
                .await;
        }
    }

    /// Frames `ops` into one multipart body and POSTs it to `endpoint`,
    /// retrying transient failures with full-jitter exponential backoff
    /// up to `max_retries` attempts. Exhaustion is logged and the batch
    /// dropped — dispatcher failure must never surface to user code.
    async fn send_to_destination(
        &self,
        endpoint: &str,
        api_key: Option<&str>,
        workspace_id: Option<&str>,
        ops: &[Operation],
    ) {
        if ops.is_empty() {
            return;
        }
        let mut writer = MultipartWriter::new();
        for op in ops {
            if let Err(e) = writer.write_operation(op) {
                tracing::error!(error = %e, "failed to frame operation; dropping batch entry");
            }
        }
        let content_type = writer.content_type();
        let body = writer.finish().freeze();

        let mut attempt = 0u32;
        loop {
            let mut req = self
                .http
                .post(format!("{endpoint}/runs/multipart"))
                .header("Content-Type", content_type.clone())
                .body(body.clone());
            if let Some(key) = api_key {
                req = req.header("x-api-key", key);
            }
            if let Some(ws) = workspace_id {
                req = req.header("x-tenant-id", ws);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(endpoint = %endpoint, count = ops.len(), "batch sent");
                    break;
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !is_retryable_status(status.as_u16()) {
                        tracing::warn!(endpoint = %endpoint, %status, "batch rejected by client error; dropping");
                        break;
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::warn!(endpoint = %endpoint, %status, attempts = attempt, "batch send exhausted retries; dropping");
                        break;
                    }
                    tokio::time::sleep(retry::backoff_delay(attempt)).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::warn!(endpoint = %endpoint, error = %e, attempts = attempt, "batch send exhausted retries; dropping");
                        break;
                    }
                    tracing::debug!(endpoint = %endpoint, error = %e, attempt, "batch send failed; retrying");
                    tokio::time::sleep(retry::backoff_delay(attempt)).await;
                }
            }
        }
    }

    fn endpoint_targets(&self) -> Vec<(String, Option<String>)> {
        match &self.config.endpoints {
            EndpointConfig::Single { endpoint, api_key } => {
                vec![(endpoint.clone(), api_key.clone())]
            }
            EndpointConfig::Multi(map) => map.iter().map(|(e, k)| (e.clone(), k.clone())).collect(),
        }
    }

    /// Expands `op.replicas` into one physical operation per
    /// destination, with freshly minted, replica-local ids so a run
    /// mirrored to several backends never collides with itself.
    async fn expand_replicas(&self, op: Operation) -> Vec<Operation> {
        if op.replicas.is_empty() {
            return vec![op];
        }
        let mut remap = self.replica_remap.lock().await;
        let mut expanded = Vec::with_capacity(op.replicas.len() + 1);
        expanded.push(Operation {
            replicas: Vec::new(),
            ..op.clone()
        });
        for replica in &op.replicas {
            let remapped_id = *remap.entry(op.run.id).or_insert_with(RunId::new);
            let mut run = op.run.clone();
            run.id = remapped_id;
            if let Some(project) = &replica.project {
                run.project_name = Some(project.clone());
            }
            if let Some(example_id) = replica.reference_example_id {
                run.reference_example_id = Some(example_id);
            }
            expanded.push(Operation {
                kind: op.kind,
                run,
                attachments: op.attachments.clone(),
                endpoint: replica.endpoint.clone(),
                api_key: replica.api_key.clone(),
                workspace_id: replica.workspace_id.clone(),
                replicas: Vec::new(),
            });
        }
        expanded
    }

    /// Waits until the queue is empty and every in-flight send has
    /// released its permit.
    pub async fn drain(&self) {
        loop {
            if self.queue_len.load(Ordering::SeqCst) == 0
                && self.send_permits.available_permits() == self.config.max_concurrency
            {
                return;
            }
            self.drained_signal.notified().await;
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// 408/409/429/5xx are transient; any other 4xx is a permanent client
/// error the retry policy must not retry.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429) || (500..=599).contains(&status)
}

impl RunSink for Dispatcher {
    fn enqueue(&self, mut op: Operation) {
        if self.config.hide_inputs {
            op.run.inputs.clear();
        }
        if self.config.hide_outputs {
            if let Some(outputs) = &mut op.run.outputs {
                outputs.clear();
            }
        }

        if !self.sampler.admit(&op) {
            tracing::debug!(run_id = %op.run.id, trace_id = %op.run.trace_id, "operation dropped by sampler");
            return;
        }

        let config_high_water = self.config.queue_high_water;
        let current = self.queue_len.load(Ordering::SeqCst);
        if current >= config_high_water {
            tracing::warn!(
                run_id = %op.run.id,
                queue_len = current,
                "dispatcher queue above high-water mark"
            );
        }

        let op_kind_is_update = matches!(op.kind, OpKind::Update { .. });
        let run_id = op.run.id;
        tracing::trace!(run_id = %run_id, is_update = op_kind_is_update, "operation queued");

        // `enqueue` is a synchronous trait method (`Run`'s lifecycle
        // methods are sync), but the queue lives behind a `tokio::sync::Mutex`
        // so the flush loop can hold it across an `.await`-free critical
        // section too. Contention here is always brief (the flush loop
        // only holds the lock to drain, never across I/O), so blocking
        // the caller's thread briefly is preferable to dropping the
        // operation or requiring every caller to be async.
        let state_mutex = &self.state;
        let mut state = match state_mutex.try_lock() {
            Ok(g) => g,
            Err(_) => tokio::task::block_in_place(|| state_mutex.blocking_lock()),
        };

        if let Some(&idx) = state.last_index.get(&run_id) {
            if idx < state.queue.len() && state.queue[idx].run.id == run_id {
                // Merge into the existing queued entry: a later update's
                // fields always win, but the merged entry keeps `Create`
                // as its kind if the queued entry was already a create —
                // the backend must still see a `post` for a run it has
                // never seen before, per spec's create-before-update rule.
                let keep_as_create = matches!(state.queue[idx].kind, OpKind::Create);
                let mut merged_attachments = state.queue[idx].attachments.clone();
                merged_attachments.extend(op.attachments.clone());
                // Inputs present in the queued create are preserved only
                // if the incoming operation didn't carry its own —
                // `patch_run(true)` clears its update's inputs precisely
                // so the create stays authoritative here.
                let mut op = op;
                if op.run.inputs.is_empty() {
                    op.run.inputs = state.queue[idx].run.inputs.clone();
                }
                state.queue[idx] = Operation {
                    kind: if keep_as_create { OpKind::Create } else { op.kind },
                    attachments: merged_attachments,
                    ..op
                };
                drop(state);
                return;
            }
        }

        let idx = state.queue.len();
        state.last_index.insert(run_id, idx);
        state.queue.push_back(op);
        drop(state);
        self.queue_len.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfigBuilder;
    use crate::operation::RunSnapshot;
    use crate::run::RunStatus;
    use serde_json::Map;
    use std::collections::HashMap as StdHashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_op(kind: OpKind, id: RunId) -> Operation {
        Operation {
            kind,
            run: RunSnapshot {
                id,
                trace_id: id,
                parent_run_id: None,
                dotted_order: "x".into(),
                name: "n".into(),
                run_type: "chain".into(),
                start_time: 0,
                end_time: None,
                status: RunStatus::Pending,
                inputs: Map::new(),
                outputs: None,
                error: None,
                extra: Map::new(),
                events: vec![],
                tags: vec![],
                reference_example_id: None,
                project_name: None,
                session_name: None,
            },
            attachments: StdHashMap::new(),
            endpoint: None,
            api_key: None,
            workspace_id: None,
            replicas: vec![],
        }
    }

    fn test_config(endpoint: &str) -> ClientConfig {
        ClientConfigBuilder::new()
            .endpoint(endpoint)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_merges_update_into_pending_create() {
        let dispatcher = Dispatcher::new(test_config("http://example.invalid"));
        let id = RunId::new();
        dispatcher.enqueue(sample_op(OpKind::Create, id));
        dispatcher.enqueue(sample_op(OpKind::Update { exclude_inputs: false }, id));
        let state = dispatcher.state.lock().await;
        assert_eq!(state.queue.len(), 1);
        assert!(matches!(state.queue[0].kind, OpKind::Create));
    }

    #[tokio::test]
    async fn merge_preserves_create_inputs_when_update_excludes_them() {
        let dispatcher = Dispatcher::new(test_config("http://example.invalid"));
        let id = RunId::new();
        let mut create = sample_op(OpKind::Create, id);
        create.run.inputs.insert("a".into(), serde_json::Value::from(1));
        dispatcher.enqueue(create);

        // Mirrors `patch_run(true)`: the update's inputs are cleared
        // before it ever reaches the dispatcher.
        let update = sample_op(OpKind::Update { exclude_inputs: true }, id);
        dispatcher.enqueue(update);

        let state = dispatcher.state.lock().await;
        assert_eq!(state.queue.len(), 1);
        assert_eq!(
            state.queue[0].run.inputs.get("a"),
            Some(&serde_json::Value::from(1))
        );
    }

    #[tokio::test]
    async fn flush_sends_batch_to_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runs/multipart"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(test_config(&server.uri()));
        dispatcher.enqueue(sample_op(OpKind::Create, RunId::new()));
        tokio::time::timeout(std::time::Duration::from_secs(2), dispatcher.drain())
            .await
            .expect("dispatcher drained before timeout");
    }

    #[tokio::test]
    async fn replica_expansion_mints_disjoint_ids() {
        let dispatcher = Dispatcher::new(test_config("http://example.invalid"));
        let mut op = sample_op(OpKind::Create, RunId::new());
        op.replicas.push(crate::operation::Replica {
            project: Some("mirror".into()),
            reference_example_id: None,
            endpoint: Some("http://mirror.invalid".into()),
            api_key: None,
            workspace_id: None,
        });
        let original_id = op.run.id;
        let expanded = dispatcher.expand_replicas(op).await;
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].run.id, original_id);
        assert_ne!(expanded[1].run.id, original_id);
        assert_eq!(expanded[1].run.project_name.as_deref(), Some("mirror"));
    }

    #[tokio::test]
    async fn fan_out_delivers_to_both_destinations() {
        let primary = MockServer::start().await;
        let mirror = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runs/multipart"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&primary)
            .await;
        Mock::given(method("POST"))
            .and(path("/runs/multipart"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mirror)
            .await;

        let dispatcher = Dispatcher::new(test_config(&primary.uri()));
        let mut op = sample_op(OpKind::Create, RunId::new());
        op.replicas.push(crate::operation::Replica {
            project: Some("mirror-project".into()),
            reference_example_id: None,
            endpoint: Some(mirror.uri()),
            api_key: None,
            workspace_id: None,
        });
        dispatcher.enqueue(op);
        tokio::time::timeout(std::time::Duration::from_secs(2), dispatcher.drain())
            .await
            .expect("dispatcher drained before timeout");
    }

    #[tokio::test]
    async fn hide_inputs_clears_inputs_before_queueing() {
        let dispatcher = Dispatcher::new(ClientConfigBuilder::new()
            .endpoint("http://example.invalid")
            .hide_inputs(true)
            .build()
            .unwrap());
        let mut op = sample_op(OpKind::Create, RunId::new());
        op.run.inputs.insert("secret".into(), serde_json::Value::from("x"));
        dispatcher.enqueue(op);
        let state = dispatcher.state.lock().await;
        assert!(state.queue[0].run.inputs.is_empty());
    }
}
