//! Client configuration: recognized keys, their effects, and the
//! environment-variable mirror of each.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, TraceError};

/// Default flush thresholds, chosen so the framed multipart body stays
/// comfortably under a typical reverse-proxy upload cap.
pub const DEFAULT_BATCH_SIZE_LIMIT: usize = 100;
pub const DEFAULT_BATCH_BYTE_LIMIT: usize = 20 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// High/low water marks for dispatcher backpressure.
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 10_000;
pub const DEFAULT_QUEUE_LOW_WATER: usize = 5_000;

/// How the client resolves which endpoint(s) it talks to.
#[derive(Debug, Clone)]
pub enum EndpointConfig {
    /// A single ingest endpoint with one API key.
    Single { endpoint: String, api_key: Option<String> },
    /// `runsEndpoints`: fan-out to several endpoints, each with its own
    /// key. Mutually exclusive with `Single`.
    Multi(HashMap<String, Option<String>>),
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoints: EndpointConfig,
    pub workspace_id: Option<String>,
    pub project: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_concurrency: usize,
    pub batch_size_limit: usize,
    pub batch_byte_limit: usize,
    pub queue_high_water: usize,
    pub queue_low_water: usize,
    pub sampling_rate: f64,
    pub hide_inputs: bool,
    pub hide_outputs: bool,
    pub tracing_enabled: bool,
}

/// Builds a [`ClientConfig`], validating synchronously at construction
/// time so misconfiguration fails before any run is recorded.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    endpoint: Option<String>,
    api_key: Option<String>,
    runs_endpoints: Option<HashMap<String, Option<String>>>,
    workspace_id: Option<String>,
    project: Option<String>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    max_concurrency: Option<usize>,
    batch_size_limit: Option<usize>,
    batch_byte_limit: Option<usize>,
    sampling_rate: Option<f64>,
    hide_inputs: bool,
    hide_outputs: bool,
    tracing_enabled: Option<bool>,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every recognized key from the environment, using the
    /// `OB_TRACE_` prefix.
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        if let Ok(v) = std::env::var("OB_TRACE_ENDPOINT") {
            builder.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("OB_TRACE_API_KEY") {
            builder.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OB_TRACE_RUNS_ENDPOINTS") {
            if let Ok(map) = serde_json::from_str::<HashMap<String, Option<String>>>(&v) {
                builder.runs_endpoints = Some(map);
            } else {
                tracing::warn!("OB_TRACE_RUNS_ENDPOINTS is not valid JSON; ignoring");
            }
        }
        if let Ok(v) = std::env::var("OB_TRACE_WORKSPACE_ID") {
            builder.workspace_id = Some(v);
        }
        if let Ok(v) = std::env::var("OB_TRACE_PROJECT") {
            builder.project = Some(v);
        }
        if let Some(v) = std::env::var("OB_TRACE_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()) {
            builder.timeout_ms = Some(v);
        }
        if let Some(v) = std::env::var("OB_TRACE_MAX_RETRIES").ok().and_then(|s| s.parse().ok()) {
            builder.max_retries = Some(v);
        }
        if let Some(v) = std::env::var("OB_TRACE_MAX_CONCURRENCY").ok().and_then(|s| s.parse().ok()) {
            builder.max_concurrency = Some(v);
        }
        if let Some(v) = std::env::var("OB_TRACE_SAMPLING_RATE").ok().and_then(|s| s.parse().ok()) {
            builder.sampling_rate = Some(v);
        }
        if let Ok(v) = std::env::var("OB_TRACE_HIDE_INPUTS") {
            builder.hide_inputs = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("OB_TRACE_HIDE_OUTPUTS") {
            builder.hide_outputs = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("OB_TRACE_TRACING_ENABLED") {
            builder.tracing_enabled = Some(v != "false" && v != "0");
        }
        builder
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn runs_endpoints(mut self, endpoints: HashMap<String, Option<String>>) -> Self {
        self.runs_endpoints = Some(endpoints);
        self
    }

    pub fn workspace_id(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn batch_size_limit(mut self, n: usize) -> Self {
        self.batch_size_limit = Some(n);
        self
    }

    pub fn batch_byte_limit(mut self, n: usize) -> Self {
        self.batch_byte_limit = Some(n);
        self
    }

    pub fn sampling_rate(mut self, r: f64) -> Self {
        self.sampling_rate = Some(r);
        self
    }

    pub fn hide_inputs(mut self, hide: bool) -> Self {
        self.hide_inputs = hide;
        self
    }

    pub fn hide_outputs(mut self, hide: bool) -> Self {
        self.hide_outputs = hide;
        self
    }

    pub fn tracing_enabled(mut self, enabled: bool) -> Self {
        self.tracing_enabled = Some(enabled);
        self
    }

    /// Validates and finalizes configuration. Fails synchronously when
    /// both a single endpoint and `runsEndpoints` are configured, or
    /// when neither is, or when the sampling rate is outside `[0, 1]`.
    pub fn build(self) -> Result<ClientConfig> {
        let endpoints = match (self.endpoint, self.runs_endpoints) {
            (Some(_), Some(_)) => {
                return Err(TraceError::Validation(
                    "both a single `endpoint` and `runsEndpoints` were configured; they are mutually exclusive".into(),
                ))
            }
            (Some(endpoint), None) => EndpointConfig::Single {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_key: self.api_key,
            },
            (None, Some(map)) => {
                if map.is_empty() {
                    return Err(TraceError::Validation("`runsEndpoints` must not be empty".into()));
                }
                EndpointConfig::Multi(
                    map.into_iter()
                        .map(|(k, v)| (k.trim_end_matches('/').to_string(), v))
                        .collect(),
                )
            }
            (None, None) => {
                return Err(TraceError::Validation(
                    "no endpoint configured: set `endpoint` or `runsEndpoints`".into(),
                ))
            }
        };

        let sampling_rate = self.sampling_rate.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&sampling_rate) {
            return Err(TraceError::Validation(format!(
                "samplingRate must be within [0, 1], got {sampling_rate}"
            )));
        }

        Ok(ClientConfig {
            endpoints,
            workspace_id: self.workspace_id,
            project: self.project,
            timeout: Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            max_concurrency: self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            batch_size_limit: self.batch_size_limit.unwrap_or(DEFAULT_BATCH_SIZE_LIMIT),
            batch_byte_limit: self.batch_byte_limit.unwrap_or(DEFAULT_BATCH_BYTE_LIMIT),
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            queue_low_water: DEFAULT_QUEUE_LOW_WATER,
            sampling_rate,
            hide_inputs: self.hide_inputs,
            hide_outputs: self.hide_outputs,
            tracing_enabled: self.tracing_enabled.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_both_single_and_multi_endpoint() {
        let mut map = HashMap::new();
        map.insert("https://a".to_string(), None);
        let err = ClientConfigBuilder::new()
            .endpoint("https://b")
            .runs_endpoints(map)
            .build()
            .unwrap_err();
        assert!(matches!(err, TraceError::Validation(_)));
    }

    #[test]
    fn rejects_no_endpoint() {
        let err = ClientConfigBuilder::new().build().unwrap_err();
        assert!(matches!(err, TraceError::Validation(_)));
    }

    #[test]
    fn strips_trailing_slash() {
        let cfg = ClientConfigBuilder::new()
            .endpoint("https://api.example.com/")
            .build()
            .unwrap();
        match cfg.endpoints {
            EndpointConfig::Single { endpoint, .. } => assert_eq!(endpoint, "https://api.example.com"),
            _ => panic!("expected single endpoint"),
        }
    }

    #[test]
    fn rejects_out_of_range_sampling_rate() {
        let err = ClientConfigBuilder::new()
            .endpoint("https://api.example.com")
            .sampling_rate(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, TraceError::Validation(_)));
    }
}
