//! Ambient context: a task-local "current run" slot.
//!
//! Rust's async runtimes are not single-threaded by default the way a
//! single-threaded event loop would be — tokio's multi-thread runtime
//! can resume a task on a different worker thread after any suspension
//! point. `tokio::task_local!` is scoped per
//! *task*, not per thread, so it is the correct primitive here: a value
//! installed with [`CurrentRun::enter`] is restored across every
//! `.await` inside the scoped future regardless of which thread
//! actually polls it, which is a stronger guarantee than "the same OS
//! thread" — a guarantee nothing in this crate relies on.

use std::cell::RefCell;

use crate::run::Run;

tokio::task_local! {
    static CURRENT_RUN: Option<Run>;
}

thread_local! {
    static SYNC_CURRENT_RUN: RefCell<Vec<Option<Run>>> = const { RefCell::new(Vec::new()) };
}

/// Operations on the ambient "current run" slot.
pub struct CurrentRun;

impl CurrentRun {
    /// Installs `run` as current for the duration of `fut`, restoring
    /// whatever was current before on every exit path — normal return,
    /// panic unwind, or early drop of the returned future.
    pub async fn enter<F, T>(run: Option<Run>, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        CURRENT_RUN.scope(run, fut).await
    }

    /// Reads the current run for the executing task, if any. Returns
    /// `None` both when nothing was ever entered and when called
    /// outside of any `enter` scope.
    pub fn get() -> Option<Run> {
        CURRENT_RUN.try_with(|r| r.clone()).unwrap_or(None)
    }

    /// Captures the current value so it can be re-entered later — used
    /// by the traceable wrapper when it lifts a user-returned stream or
    /// iterator: each `poll_next`/`next()` call must run under the
    /// context that existed at the time of the *wrapping* call, not at
    /// the time the item is actually produced.
    pub fn snapshot() -> ContextSnapshot {
        ContextSnapshot(Self::get())
    }

    /// Sync, thread-local equivalent of [`CurrentRun::enter`] for the
    /// sync-generator wrapping case, where there is no `.await`
    /// boundary to scope a task-local around. RAII-guarded: the
    /// previous value (if any) is restored when the guard drops, on
    /// every exit path including panics.
    pub fn enter_sync(run: Option<Run>) -> SyncGuard {
        SYNC_CURRENT_RUN.with(|stack| stack.borrow_mut().push(run));
        SyncGuard { _private: () }
    }

    pub fn get_sync() -> Option<Run> {
        SYNC_CURRENT_RUN.with(|stack| stack.borrow().last().cloned().flatten())
    }
}

/// A captured ambient-context value that can be re-entered later.
#[derive(Clone)]
pub struct ContextSnapshot(Option<Run>);

impl ContextSnapshot {
    /// Re-enters the snapshotted context for the duration of `fut`.
    pub async fn enter<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        CurrentRun::enter(self.0.clone(), fut).await
    }

    pub fn run(&self) -> Option<Run> {
        self.0.clone()
    }

    /// Sync equivalent of [`ContextSnapshot::enter`], for re-entering the
    /// captured context around a single synchronous call with no
    /// `.await` point of its own — used by [`crate::traceable::TracedStream`]'s
    /// `poll_next`, which cannot `.await` a task-local scope from inside
    /// a `Future::poll` implementation.
    pub fn enter_blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT_RUN.sync_scope(self.0.clone(), f)
    }
}

/// RAII guard restoring the previous sync ambient-context value on drop.
pub struct SyncGuard {
    _private: (),
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        SYNC_CURRENT_RUN.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
