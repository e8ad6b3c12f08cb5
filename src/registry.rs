//! Process-wide weak registry of live runs.
//!
//! Run-to-child references form a tree of owning `Arc`s, but metadata can
//! carry back-edges — e.g. a root run's id embedded in a descendant's
//! `extra` map for later lookup. Those back-edges are represented here
//! as id-keyed `Weak` entries rather than embedded owning references, so
//! they never keep a run alive past its natural lifetime and are never
//! serialized as nested objects on the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::ids::RunId;
use crate::run::RunInner;

static REGISTRY: OnceLock<Mutex<HashMap<RunId, Weak<RunInner>>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<RunId, Weak<RunInner>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a run so it can be looked up by id elsewhere in the
/// process. Does not extend the run's lifetime.
pub fn register(id: RunId, inner: &Arc<RunInner>) {
    let mut guard = table().lock().expect("run registry poisoned");
    guard.insert(id, Arc::downgrade(inner));
    // Opportunistic cleanup: drop dead entries so the map doesn't grow
    // without bound over a long-lived process.
    guard.retain(|_, weak| weak.strong_count() > 0);
}

/// Looks up a run by id. Returns `None` if the run never existed in
/// this process or has since been dropped.
pub fn lookup(id: RunId) -> Option<Arc<RunInner>> {
    table().lock().expect("run registry poisoned").get(&id)?.upgrade()
}
