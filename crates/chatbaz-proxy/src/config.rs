//! Deployment constants for the intercept and upstream endpoints.
//!
//! The values are fixed at deployment time; the struct exists so the
//! forwarding engine and the tests can inject alternates (a stub upstream on
//! a loopback port, for instance) without touching the rewrite logic.

/// Host Cursor is configured to talk to.
const INTERCEPT_HOST: &str = "api.anthropic.com";

/// Host the proxy actually forwards to.
const UPSTREAM_HOST: &str = "chatbaz.app";

const UPSTREAM_SCHEME: &str = "https";
const UPSTREAM_PORT: u16 = 443;

/// Path prefix prepended to every intercepted request.
const UPSTREAM_PREFIX: &str = "/claude";

/// Endpoint configuration for one proxy deployment.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Requests whose host equals this exactly are rewritten; everything
    /// else passes through untouched. No wildcarding.
    pub intercept_host: String,

    /// Scheme used when forwarding upstream.
    pub upstream_scheme: String,

    /// Upstream host, also written into the `Host` header.
    pub upstream_host: String,

    /// Upstream port.
    pub upstream_port: u16,

    /// Prefix prepended to intercepted paths (idempotently).
    pub upstream_prefix: String,

    /// Display name used in synthesized error bodies and console output.
    pub upstream_name: String,

    /// Remediation hint included in the synthesized 401 body.
    pub remediation: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            intercept_host: INTERCEPT_HOST.to_string(),
            upstream_scheme: UPSTREAM_SCHEME.to_string(),
            upstream_host: UPSTREAM_HOST.to_string(),
            upstream_port: UPSTREAM_PORT,
            upstream_prefix: UPSTREAM_PREFIX.to_string(),
            upstream_name: "ChatBAZ".to_string(),
            remediation: "Run: chatbaz-proxy set-key".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Base URL of the upstream including the path prefix.
    ///
    /// The port is omitted when it is the default for the scheme, matching
    /// how the URL would normally be written.
    #[must_use]
    pub fn upstream_base(&self) -> String {
        let default_port = matches!(
            (self.upstream_scheme.as_str(), self.upstream_port),
            ("https", 443) | ("http", 80)
        );
        if default_port {
            format!(
                "{}://{}{}",
                self.upstream_scheme, self.upstream_host, self.upstream_prefix
            )
        } else {
            format!(
                "{}://{}:{}{}",
                self.upstream_scheme, self.upstream_host, self.upstream_port, self.upstream_prefix
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let config = ProxyConfig::default();
        assert_eq!(config.intercept_host, "api.anthropic.com");
        assert_eq!(config.upstream_base(), "https://chatbaz.app/claude");
    }

    #[test]
    fn test_upstream_base_keeps_non_default_port() {
        let config = ProxyConfig {
            upstream_scheme: "http".to_string(),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 8123,
            ..ProxyConfig::default()
        };
        assert_eq!(config.upstream_base(), "http://127.0.0.1:8123/claude");
    }
}
