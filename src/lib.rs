//! `ob-trace` — the client-side tracing core of an observability SDK for
//! LLM/agent workloads.
//!
//! Turns arbitrary user-authored functions into **runs** organized as
//! trees ([`run`]), captures their inputs/outputs/events/errors with
//! wall-clock timing, and ships them asynchronously to a remote tracing
//! service ([`dispatcher`]) — while remaining correct under concurrent,
//! nested, and streaming execution ([`traceable`]).
//!
//! The three tightly coupled subsystems that make up the core:
//!
//! - [`run`] + [`ids`] — the run-tree model and the deterministic
//!   `dotted_order` identifier algebra.
//! - [`traceable`] — the higher-order wrapper that turns a callable into
//!   an instrumented one, across every return shape spec.md enumerates.
//! - [`dispatcher`] — the asynchronous batching client that ships
//!   create/update operations to one or more destinations.
//!
//! [`context`] provides the ambient "current run" slot that ties the
//! other two together across suspension points; [`sampling`],
//! [`propagation`], [`multipart`], [`config`], and [`env_probe`] round
//! out the supporting cast described in spec.md §4.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod env_probe;
pub mod error;
pub mod ids;
pub mod multipart;
pub mod operation;
pub mod propagation;
pub mod registry;
pub mod run;
pub mod sampling;
pub mod traceable;

#[cfg(feature = "otel")]
pub mod otel;

pub use config::{ClientConfig, ClientConfigBuilder, EndpointConfig};
pub use context::{ContextSnapshot, CurrentRun};
pub use dispatcher::Dispatcher;
pub use error::{Result, TraceError};
pub use ids::RunId;
pub use operation::{Operation, OpKind, Replica, RunSink, RunSnapshot};
pub use propagation::{Baggage, BAGGAGE_HEADER, TRACE_HEADER};
pub use run::{Run, RunConfig, RunStatus, RunType};
pub use traceable::{
    trace_call, trace_call_deferred, trace_iter, trace_object_stream, trace_stream, Aggregator,
    ParentRef, TraceConfig, TracedStream,
};

/// A fully assembled client: configuration plus the dispatcher it
/// drives. The conventional entry point for an application wiring this
/// crate up once at startup — mirrors `sem_os_client`'s pattern of one
/// long-lived handle shared across call sites.
pub struct TraceClient {
    dispatcher: std::sync::Arc<Dispatcher>,
}

impl TraceClient {
    /// Builds the dispatcher (which starts its background flush loop
    /// immediately) from a validated [`ClientConfig`].
    pub fn new(config: ClientConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(config),
        }
    }

    /// The dispatcher as a [`RunSink`], for attaching to [`RunConfig`]/
    /// [`TraceConfig`] via `.sink(...)`.
    pub fn sink(&self) -> std::sync::Arc<dyn RunSink> {
        self.dispatcher.clone() as std::sync::Arc<dyn RunSink>
    }

    /// Waits until every enqueued operation has been sent (or dropped
    /// after exhausting retries). Call from shutdown hooks and tests.
    pub async fn drain(&self) {
        self.dispatcher.drain().await;
    }

    /// Signals the background flush loop to stop once the queue drains.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_client_wires_a_root_run_to_the_dispatcher() {
        let config = ClientConfigBuilder::new()
            .endpoint("http://example.invalid")
            .build()
            .unwrap();
        let client = TraceClient::new(config);
        let run = RunConfig::new("root").sink(client.sink()).build();
        run.post_run();
        client.shutdown();
        // Draining after shutdown must still succeed once the queue empties.
        tokio::time::timeout(std::time::Duration::from_secs(2), client.drain())
            .await
            .expect("client drained before timeout");
    }
}
