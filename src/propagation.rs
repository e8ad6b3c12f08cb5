//! Propagation: cross-process handoff via a `trace` header and a
//! `baggage` header.

use http::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::{Map, Value};

use crate::error::{Result, TraceError};
use crate::ids;
use crate::operation::Replica;
use crate::run::RunConfig;

pub const TRACE_HEADER: &str = "trace";
pub const BAGGAGE_HEADER: &str = "baggage";

const BAGGAGE_VALUE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b',').add(b'=').add(b';').add(b'%');

/// The decoded contents of a `baggage` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baggage {
    pub metadata: Map<String, Value>,
    pub tags: Vec<String>,
    pub project: Option<String>,
    pub replicas: Vec<Replica>,
}

impl Baggage {
    /// Merges `self` on top of `inherited`, preferring `self`'s values
    /// where both set the same field.
    pub fn merge_over(mut self, inherited: Option<Baggage>) -> Self {
        let Some(inherited) = inherited else { return self };
        for (k, v) in inherited.metadata {
            self.metadata.entry(k).or_insert(v);
        }
        if self.tags.is_empty() {
            self.tags = inherited.tags;
        }
        if self.project.is_none() {
            self.project = inherited.project;
        }
        if self.replicas.is_empty() {
            self.replicas = inherited.replicas;
        }
        self
    }
}

/// Encodes `dotted_order` and `baggage` as a `trace`/`baggage` header
/// pair.
pub fn to_headers(dotted_order: &str, baggage: &Baggage) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(TRACE_HEADER),
        HeaderValue::from_str(dotted_order)
            .map_err(|e| TraceError::Propagation(format!("dotted_order not header-safe: {e}")))?,
    );
    if let Some(encoded) = encode_baggage(baggage) {
        headers.insert(
            HeaderName::from_static(BAGGAGE_HEADER),
            HeaderValue::from_str(&encoded)
                .map_err(|e| TraceError::Propagation(format!("baggage not header-safe: {e}")))?,
        );
    }
    Ok(headers)
}

fn encode_baggage(baggage: &Baggage) -> Option<String> {
    let mut pairs = Vec::new();
    if !baggage.metadata.is_empty() {
        pairs.push(baggage_pair("metadata", &Value::Object(baggage.metadata.clone())));
    }
    if !baggage.tags.is_empty() {
        pairs.push(baggage_pair("tags", &Value::from(baggage.tags.clone())));
    }
    if let Some(project) = &baggage.project {
        pairs.push(baggage_pair("project", &Value::String(project.clone())));
    }
    if !baggage.replicas.is_empty() {
        let replicas_json = serde_json::to_value(&baggage.replicas).unwrap_or(Value::Null);
        pairs.push(baggage_pair("replicas", &replicas_json));
    }
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join(","))
    }
}

fn baggage_pair(key: &str, value: &Value) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    format!("{key}={}", utf8_percent_encode(&json, BAGGAGE_VALUE_ENCODE_SET))
}

fn decode_baggage(raw: &str) -> Baggage {
    let mut baggage = Baggage::default();
    for kv in raw.split(',') {
        let kv = kv.trim();
        if kv.is_empty() {
            continue;
        }
        let Some((key, value)) = kv.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            // Empty-valued entries are dropped rather than round-tripped.
            continue;
        }
        let decoded = percent_decode_str(value).decode_utf8_lossy().to_string();
        let Ok(parsed) = serde_json::from_str::<Value>(&decoded) else {
            continue;
        };
        match key {
            "metadata" => {
                if let Value::Object(map) = parsed {
                    baggage.metadata = map;
                }
            }
            "tags" => {
                if let Value::Array(arr) = parsed {
                    baggage.tags = arr
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
            }
            "project" => {
                if let Value::String(s) = parsed {
                    baggage.project = Some(s);
                }
            }
            "replicas" => {
                if let Ok(replicas) = serde_json::from_value::<Vec<Replica>>(parsed) {
                    baggage.replicas = replicas;
                }
            }
            _ => {}
        }
    }
    baggage
}

/// Parses an incoming `trace`/`baggage` header pair into a
/// [`RunConfig`] for a synthetic parent run positioned exactly where
/// the remote producer's run was, plus the decoded baggage (merged
/// over `inherited`, if given).
///
/// On a malformed `trace` header, no synthetic parent is built — the
/// caller should treat this call as a root and log at debug. Returns
/// `None` in that case rather than an error: propagation failures are
/// never fatal.
pub fn from_headers(headers: &HeaderMap, inherited: Option<Baggage>) -> Option<(RunConfig, Baggage)> {
    let trace_value = headers.get(TRACE_HEADER)?.to_str().ok()?;
    let segments = match ids::split_segments(trace_value) {
        Ok(s) if !s.is_empty() => s,
        _ => {
            tracing::debug!(trace = %trace_value, "malformed trace header; proceeding as root");
            return None;
        }
    };

    let last = segments.last().unwrap();
    let (start_time, _) = ids::decode_timestamp_lex(&last.timestamp_lex).ok()?;
    let trace_id = segments.first().unwrap().id;
    let parent_run_id = if segments.len() > 1 {
        Some(segments[segments.len() - 2].id)
    } else {
        None
    };

    let cfg = RunConfig::new("remote").synthetic_from_wire(
        last.id,
        trace_id,
        parent_run_id,
        start_time,
        trace_value.to_string(),
    );

    let baggage = headers
        .get(BAGGAGE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(decode_baggage)
        .unwrap_or_default()
        .merge_over(inherited);

    Some((cfg, baggage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RunId;

    #[test]
    fn headers_round_trip_modulo_empty_baggage_entries() {
        let root_id = RunId::new();
        let seg = ids::Segment::new(1_700_000_000_000, 0, root_id);
        let dotted = ids::join_segments(&[], &seg);

        let mut metadata = Map::new();
        metadata.insert("k".into(), Value::from("v"));
        let baggage = Baggage {
            metadata,
            tags: vec!["t1".into(), "t2".into()],
            project: Some("proj".into()),
            replicas: vec![],
        };

        let headers = to_headers(&dotted, &baggage).unwrap();
        let (cfg, decoded) = from_headers(&headers, None).unwrap();
        let rebuilt = cfg.build();
        assert_eq!(rebuilt.dotted_order(), dotted);
        assert_eq!(rebuilt.trace_id(), root_id);

        let headers2 = to_headers(rebuilt.dotted_order(), &decoded).unwrap();
        assert_eq!(headers.get(TRACE_HEADER), headers2.get(TRACE_HEADER));
        assert_eq!(headers.get(BAGGAGE_HEADER), headers2.get(BAGGAGE_HEADER));
    }

    #[test]
    fn malformed_trace_header_yields_none() {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(TRACE_HEADER), HeaderValue::from_static("not-a-dotted-order"));
        assert!(from_headers(&headers, None).is_none());
    }

    #[test]
    fn child_dotted_order_extends_producer_root() {
        let root_id = RunId::new();
        let seg = ids::Segment::new(1_700_000_000_000, 0, root_id);
        let dotted = ids::join_segments(&[], &seg);
        let headers = to_headers(&dotted, &Baggage::default()).unwrap();
        let (cfg, _) = from_headers(&headers, None).unwrap();
        let synthetic_parent = cfg.build();
        let child = synthetic_parent.create_child(RunConfig::new("consumer"));
        assert_eq!(child.trace_id(), root_id);
        assert!(child.dotted_order().starts_with(synthetic_parent.dotted_order()));
    }
}
