//! Request/response rewriting hooks.
//!
//! One [`RewriteEngine`] instance is constructed at process start and handed
//! to the forwarding front end, which calls [`RewriteEngine::on_request`]
//! when a request head has been parsed and [`RewriteEngine::on_response`]
//! once the upstream has answered (or failed to). All mutable state lives on
//! the instance; the request counter is atomic so concurrent flows get
//! distinct ids.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::credentials::CredentialStore;
use crate::flow::{Flow, FlowResponse};

/// Metadata key marking a flow as rewritten.
pub const METADATA_REWRITTEN: &str = "chatbaz_rewritten";

/// Metadata key carrying the request id to the response phase.
pub const METADATA_REQUEST_ID: &str = "chatbaz_request_id";

/// How the authentication header is handled for intercepted requests.
///
/// The two variants are mutually exclusive deployment choices, selected once
/// at construction and never per request.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    /// Replace any caller-supplied credentials with the stored key: the
    /// `Authorization` header is stripped and `x-api-key` set
    /// unconditionally. Requests are blocked with a synthesized 401 when no
    /// key is stored.
    Substitute {
        /// Store consulted on every intercepted request.
        store: Arc<CredentialStore>,
    },

    /// Leave the caller's `x-api-key` untouched. A missing or blank key is
    /// logged but the request is forwarded regardless.
    PassThrough,
}

/// Classifies and transforms intercepted flows; passes all others through.
pub struct RewriteEngine {
    config: ProxyConfig,
    policy: AuthPolicy,
    request_count: AtomicU64,
}

impl RewriteEngine {
    /// Creates an engine with the given endpoints and authentication policy.
    #[must_use]
    pub const fn new(config: ProxyConfig, policy: AuthPolicy) -> Self {
        Self {
            config,
            policy,
            request_count: AtomicU64::new(0),
        }
    }

    /// The endpoint configuration this engine was built with.
    #[must_use]
    pub const fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Rewrites a request path onto the upstream prefix.
    ///
    /// Already-prefixed paths are returned unchanged, so the rewrite is
    /// idempotent. The path is not parsed: a query string rides along as
    /// part of the raw string.
    #[must_use]
    pub fn rewrite_path(&self, original: &str) -> String {
        let prefix = &self.config.upstream_prefix;
        let path = ensure_leading_slash(original);
        if path == *prefix || path.starts_with(&format!("{prefix}/")) {
            return path;
        }
        format!("{prefix}{path}")
    }

    /// Request hook, invoked once per flow after the request head is parsed.
    ///
    /// Out-of-scope flows are left untouched. In-scope flows have their
    /// destination and headers rewritten in place; under the substitution
    /// policy a flow with no stored key gets a synthesized 401 response and
    /// must not be forwarded.
    pub fn on_request(&self, flow: &mut Flow) {
        if flow.host != self.config.intercept_host {
            return;
        }

        let request_id = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;

        let substitute_key = match &self.policy {
            AuthPolicy::Substitute { store } => match store.get_key() {
                Some(key) => Some(key),
                None => {
                    error!("Request blocked: API key not configured");
                    flow.response = Some(self.blocked_response());
                    return;
                }
            },
            AuthPolicy::PassThrough => None,
        };

        let original_path = flow.path.clone();
        let rewritten_path = self.rewrite_path(&original_path);

        flow.scheme.clone_from(&self.config.upstream_scheme);
        flow.host.clone_from(&self.config.upstream_host);
        flow.port = self.config.upstream_port;
        flow.path.clone_from(&rewritten_path);
        flow.headers.set("host", &self.config.upstream_host);

        match (&self.policy, substitute_key) {
            (AuthPolicy::Substitute { .. }, Some(key)) => {
                flow.headers.remove("authorization");
                flow.headers.set("x-api-key", &key);
            }
            _ => {
                let blank = flow
                    .headers
                    .get("x-api-key")
                    .is_none_or(|v| v.trim().is_empty());
                if blank {
                    warn!("Forwarding request #{request_id} without an x-api-key header");
                }
            }
        }

        flow.metadata
            .insert(METADATA_REWRITTEN.to_string(), Value::Bool(true));
        flow.metadata
            .insert(METADATA_REQUEST_ID.to_string(), json!(request_id));

        info!(
            "request #{request_id}: {}{original_path} -> {}{rewritten_path}",
            self.config.intercept_host, self.config.upstream_host
        );
    }

    /// Response hook, invoked once per flow after the upstream answered.
    ///
    /// Logs the outcome by status band; never mutates the response. Flows
    /// that were not rewritten, or that carry no response (the upstream
    /// connection failed), are skipped.
    pub fn on_response(&self, flow: &mut Flow) {
        let rewritten = flow
            .metadata
            .get(METADATA_REWRITTEN)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !rewritten {
            return;
        }

        let Some(response) = &flow.response else {
            return;
        };

        let request_id = flow
            .metadata
            .get(METADATA_REQUEST_ID)
            .and_then(Value::as_u64)
            .map_or_else(|| "?".to_string(), |id| id.to_string());

        let status = response.status;
        if status >= 500 {
            error!("upstream response #{request_id}: {status}");
        } else if status >= 400 {
            warn!("upstream response #{request_id}: {status}");
        } else {
            debug!("upstream response #{request_id}: {status}");
        }
    }

    /// The synthesized 401 returned when substitution has no key to apply.
    fn blocked_response(&self) -> FlowResponse {
        FlowResponse::json(
            401,
            &json!({
                "error": {
                    "type": "authentication_error",
                    "message": format!(
                        "{} API key is not configured.",
                        self.config.upstream_name
                    ),
                },
                "action": self.config.remediation,
            }),
        )
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
