//! Environment probe: a one-time process/runtime fingerprint, with
//! redaction of sensitive environment variables.

use std::sync::OnceLock;

use serde_json::{Map, Value};

const SENSITIVE_SUBSTRINGS: [&str; 4] = ["API_KEY", "SECRET", "TOKEN", "PASSWORD"];
const SENSITIVE_SUFFIX: &str = "_KEY";

/// Masks a value whose variable name looks sensitive: `⟨first-2⟩***⟨last-2⟩`.
/// Values shorter than 4 characters are masked entirely, since there is
/// no safe prefix/suffix to reveal.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 4 {
        return "***".to_string();
    }
    let first: String = chars[..2].iter().collect();
    let last: String = chars[chars.len() - 2..].iter().collect();
    format!("{first}***{last}")
}

/// Whether an environment variable's name matches the sensitivity
/// heuristic used to decide what gets masked before leaving the process.
pub fn is_sensitive_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_SUBSTRINGS.iter().any(|s| upper.contains(s)) || upper.ends_with(SENSITIVE_SUFFIX)
}

/// A one-time snapshot of the process/runtime environment, filtered
/// through [`is_sensitive_name`]/[`mask_value`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeInfo {
    pub runtime: String,
    pub runtime_version: String,
    pub pid: u32,
    pub hostname: String,
    pub library: String,
    pub library_version: String,
    pub env: Map<String, Value>,
}

impl RuntimeInfo {
    /// Collects the runtime fingerprint and a filtered snapshot of the
    /// process environment. Never panics — any failure to read a piece
    /// of environment data (e.g. hostname) degrades to a placeholder
    /// rather than aborting, since this is diagnostic metadata, not
    /// correctness-critical state.
    pub fn collect() -> Self {
        let env = std::env::vars()
            .map(|(k, v)| {
                let masked = if is_sensitive_name(&k) {
                    mask_value(&v)
                } else {
                    v
                };
                (k, Value::String(masked))
            })
            .collect::<Map<String, Value>>();

        Self {
            runtime: "rust".to_string(),
            runtime_version: rustc_version(),
            pid: std::process::id(),
            hostname: hostname(),
            library: env!("CARGO_PKG_NAME").to_string(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            env,
        }
    }
}

fn rustc_version() -> String {
    option_env!("CARGO_PKG_RUST_VERSION")
        .unwrap_or("unknown")
        .to_string()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

static RUNTIME_INFO: OnceLock<RuntimeInfo> = OnceLock::new();

/// The process-wide runtime fingerprint, collected once and reused —
/// stamped onto every freshly minted root run.
pub fn runtime_info() -> &'static RuntimeInfo {
    RUNTIME_INFO.get_or_init(RuntimeInfo::collect)
}

/// The subset of recognized configuration variables exposed as run
/// metadata: a revision identifier, if one was configured.
pub fn revision_metadata() -> Option<Map<String, Value>> {
    let revision = std::env::var("OB_TRACE_REVISION_ID").ok()?;
    let mut map = Map::new();
    map.insert("revision_id".to_string(), Value::String(revision));
    Some(map)
}

/// Whether `OB_TRACE_TEST_TRACKING` was set, as run metadata — lets a
/// test harness flag runs it produced without a separate side channel.
pub fn test_tracking_metadata() -> Option<Map<String, Value>> {
    let raw = std::env::var("OB_TRACE_TEST_TRACKING").ok()?;
    let mut map = Map::new();
    map.insert("test_tracking".to_string(), Value::Bool(raw == "true" || raw == "1"));
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_names_are_detected() {
        assert!(is_sensitive_name("OPENAI_API_KEY"));
        assert!(is_sensitive_name("MY_SECRET"));
        assert!(is_sensitive_name("AUTH_TOKEN"));
        assert!(is_sensitive_name("DB_PASSWORD"));
        assert!(is_sensitive_name("SIGNING_KEY"));
        assert!(!is_sensitive_name("PATH"));
        assert!(!is_sensitive_name("LANG"));
    }

    #[test]
    fn masking_preserves_only_first_and_last_two_chars() {
        assert_eq!(mask_value("sk-abcdef1234"), "sk***34");
        assert_eq!(mask_value("ab"), "***");
    }

    #[test]
    fn collect_masks_sensitive_vars_in_place() {
        std::env::set_var("OB_TRACE_TEST_PROBE_API_KEY", "sk-1234567890");
        let info = RuntimeInfo::collect();
        let masked = info
            .env
            .get("OB_TRACE_TEST_PROBE_API_KEY")
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(masked, "sk***90");
        std::env::remove_var("OB_TRACE_TEST_PROBE_API_KEY");
    }

    #[test]
    fn test_tracking_metadata_reads_truthy_values() {
        std::env::set_var("OB_TRACE_TEST_TRACKING", "true");
        let map = test_tracking_metadata().expect("variable was set");
        assert_eq!(map.get("test_tracking"), Some(&Value::Bool(true)));
        std::env::remove_var("OB_TRACE_TEST_TRACKING");

        assert!(test_tracking_metadata().is_none());
    }
}
