use thiserror::Error;

/// Errors surfaced by the public API of this crate.
///
/// Tracing-infrastructure failures (queueing, framing, HTTP, retry
/// exhaustion) never reach this type — they are logged and dropped per
/// the dispatcher's best-effort policy. `TraceError` covers only the
/// paths that are allowed to be user-visible: configuration mistakes
/// made at client construction, and malformed data the caller handed
/// us directly (e.g. parsing a dotted-order or header pair).
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("invalid client configuration: {0}")]
    Validation(String),

    #[error("malformed dotted-order segment: {0}")]
    InvalidDottedOrder(String),

    #[error("malformed propagation header: {0}")]
    Propagation(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = TraceError> = std::result::Result<T, E>;
