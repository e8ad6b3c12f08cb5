//! Sampling & filtering: per-trace sampling with patch coherence.
//!
//! The key invariant distinguishing this from per-run sampling: updates
//! and child creates consult the filtered set by `trace_id`, not `id`,
//! so every run in a trace is admitted or none are.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::Rng;

use crate::ids::RunId;
use crate::operation::{OpKind, Operation};

/// Samples root creates at a configured rate and suppresses every other
/// operation belonging to a rejected trace.
pub struct Sampler {
    rate: f64,
    filtered: Mutex<HashSet<RunId>>,
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            filtered: Mutex::new(HashSet::new()),
        }
    }

    /// Decides whether `op` should be admitted to the dispatcher queue,
    /// updating the filtered set as a side effect:
    ///
    /// - A root `create` draws a fresh uniform variate; on rejection its
    ///   trace id is recorded and the operation is dropped.
    /// - Any other operation (a child create, or any update) for an
    ///   already-filtered trace is dropped without drawing.
    /// - A root's own `update` clears its trace id from the filtered
    ///   set once processed, bounding the set's memory — but only after
    ///   returning the admit/reject decision for that very update,
    ///   which must still be a drop (the root was already rejected).
    pub fn admit(&self, op: &Operation) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        let trace_id = op.run.trace_id;
        let is_root = op.run.parent_run_id.is_none();
        let is_update = matches!(op.kind, OpKind::Update { .. });

        let mut filtered = self.filtered.lock().expect("sampler filtered-set poisoned");

        if is_root && matches!(op.kind, OpKind::Create) {
            let draw: f64 = rand::thread_rng().gen_range(0.0..1.0);
            if draw >= self.rate {
                filtered.insert(trace_id);
                return false;
            }
            return true;
        }

        if filtered.contains(&trace_id) {
            if is_root && is_update {
                // Bounded memory: release the trace id once its root
                // update has been observed and dropped.
                filtered.remove(&trace_id);
            }
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunConfig, RunStatus};
    use serde_json::Map;

    fn create_op(trace_id: RunId, parent_run_id: Option<RunId>) -> Operation {
        Operation {
            kind: OpKind::Create,
            run: crate::operation::RunSnapshot {
                id: RunId::new(),
                trace_id,
                parent_run_id,
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
            attachments: Default::default(),
            endpoint: None,
            api_key: None,
            workspace_id: None,
            replicas: vec![],
        }
    }

    #[test]
    fn rate_zero_rejects_every_trace_coherently() {
        let sampler = Sampler::new(0.0);
        let root = RunConfig::new("root").build();
        let root_create = create_op(root.trace_id(), None);
        assert!(!sampler.admit(&root_create));

        let mut child_create = create_op(root.trace_id(), Some(root.id()));
        child_create.kind = OpKind::Create;
        assert!(!sampler.admit(&child_create));

        let mut update = create_op(root.trace_id(), None);
        update.kind = OpKind::Update { exclude_inputs: false };
        assert!(!sampler.admit(&update));
    }

    #[test]
    fn rate_one_admits_everything() {
        let sampler = Sampler::new(1.0);
        let root = RunConfig::new("root").build();
        assert!(sampler.admit(&create_op(root.trace_id(), None)));
        assert!(sampler.admit(&create_op(root.trace_id(), Some(root.id()))));
    }

    #[test]
    fn root_update_releases_filtered_trace() {
        let sampler = Sampler::new(0.0);
        let root = RunConfig::new("root").build();
        assert!(!sampler.admit(&create_op(root.trace_id(), None)));
        {
            let filtered = sampler.filtered.lock().unwrap();
            assert!(filtered.contains(&root.trace_id()));
        }
        let mut update = create_op(root.trace_id(), None);
        update.kind = OpKind::Update { exclude_inputs: false };
        assert!(!sampler.admit(&update));
        {
            let filtered = sampler.filtered.lock().unwrap();
            assert!(!filtered.contains(&root.trace_id()));
        }
    }
}
