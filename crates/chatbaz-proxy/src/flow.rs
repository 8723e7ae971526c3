//! Mutable per-exchange flow model shared with the forwarding engine.
//!
//! A [`Flow`] is one request/response exchange. The engine that owns the
//! sockets builds it from the parsed request head, hands a mutable reference
//! to the rewrite hooks at each observation point, and never expects the
//! hooks to retain it.

use std::collections::HashMap;

use serde_json::Value;

/// Ordered header map with case-insensitive name matching.
///
/// HTTP header names compare case-insensitively but the wire casing is worth
/// preserving, so this is an ordered list of raw pairs rather than a
/// normalizing map. `set` overwrites in place (last write wins) and `remove`
/// deletes every casing variant of the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns the value of the first header matching `name`, ignoring case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if a header with this name exists, ignoring case.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a header value, overwriting any existing entry.
    ///
    /// The first matching entry keeps its position and takes the new name and
    /// value; further casing variants are dropped so the name maps to exactly
    /// one value afterwards. A missing name is appended.
    pub fn set(&mut self, name: &str, value: &str) {
        let mut replaced = false;
        self.entries.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *k = name.to_string();
                *v = value.to_string();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    /// Appends a header without touching existing entries.
    ///
    /// Used when rebuilding a map from parsed wire data, where duplicate
    /// names are legitimate.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Removes every casing variant of `name`. Returns true if any entry
    /// was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    /// Iterates over raw name/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries, counting duplicates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// One request/response exchange, owned by the forwarding engine and
/// mutated in place by the rewrite hooks.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Request scheme (`http` or `https`).
    pub scheme: String,

    /// Destination host, without port.
    pub host: String,

    /// Destination port.
    pub port: u16,

    /// Raw request path including any query string.
    pub path: String,

    /// Request headers.
    pub headers: Headers,

    /// Engine-local decisions carried from the request phase to the
    /// response phase of the same flow.
    pub metadata: HashMap<String, Value>,

    /// Response, once one exists. The request hook sets this to short-circuit
    /// forwarding; otherwise the engine attaches the upstream response before
    /// the response hook runs.
    pub response: Option<FlowResponse>,
}

impl Flow {
    /// Creates a flow for a freshly parsed request with no response yet.
    #[must_use]
    pub fn new(scheme: &str, host: &str, port: u16, path: &str, headers: Headers) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
            headers,
            metadata: HashMap::new(),
            response: None,
        }
    }
}

/// Response half of a flow.
///
/// For forwarded flows only the status and headers are populated; the body
/// is streamed by the engine and never buffered here. Synthesized responses
/// carry their full body.
#[derive(Debug, Clone)]
pub struct FlowResponse {
    /// HTTP status code.
    pub status: u16,

    /// Response headers.
    pub headers: Headers,

    /// Response body. Empty for forwarded flows.
    pub body: Vec<u8>,
}

impl FlowResponse {
    /// Creates a response with the given status and no headers or body.
    #[must_use]
    pub const fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Creates a synthesized JSON response.
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/json");
        Self {
            status,
            headers,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_get_is_case_insensitive() {
        let headers: Headers = [("Content-Type", "application/json")].into_iter().collect();
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.get("accept"), None);
    }

    #[test]
    fn test_set_overwrites_in_place() {
        let mut headers: Headers = [("Host", "api.anthropic.com"), ("Accept", "*/*")]
            .into_iter()
            .collect();
        headers.set("host", "chatbaz.app");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("Host"), Some("chatbaz.app"));
        // Overwrite keeps the original position
        assert_eq!(headers.iter().next(), Some(("host", "chatbaz.app")));
    }

    #[test]
    fn test_set_collapses_casing_variants() {
        let mut headers = Headers::new();
        headers.append("X-Api-Key", "one");
        headers.append("x-api-key", "two");
        headers.set("x-api-key", "three");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-API-KEY"), Some("three"));
    }

    #[test]
    fn test_remove_deletes_all_casings() {
        let mut headers = Headers::new();
        headers.append("Authorization", "Bearer a");
        headers.append("authorization", "Bearer b");
        headers.append("AUTHORIZATION", "Bearer c");
        headers.append("Accept", "*/*");

        assert!(headers.remove("authorization"));
        assert!(!headers.contains("Authorization"));
        assert_eq!(headers.len(), 1);

        // Removing again is a no-op
        assert!(!headers.remove("authorization"));
    }

    #[test]
    fn test_json_response() {
        let response = FlowResponse::json(401, &serde_json::json!({"ok": false}));
        assert_eq!(response.status, 401);
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
        let parsed: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(parsed, serde_json::json!({"ok": false}));
    }
}
