//! End-to-end tests: a real listener, a stub upstream, and a client pointed
//! at the proxy the way Cursor would be.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatbaz_proxy::{AuthPolicy, CredentialStore, ProxyConfig, RewriteEngine};
use chatbaz_proxy_cli::engine::ProxyServer;

const TEST_KEY: &str = "chatbaz-test-key-12345";

/// Points the fixed upstream constants at the stub server.
fn test_config(upstream: &MockServer) -> ProxyConfig {
    let addr = upstream.address();
    ProxyConfig {
        upstream_scheme: "http".to_string(),
        upstream_host: addr.ip().to_string(),
        upstream_port: addr.port(),
        ..ProxyConfig::default()
    }
}

async fn spawn_proxy(engine: RewriteEngine) -> SocketAddr {
    let server = ProxyServer::bind(0, Arc::new(engine)).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// Client configured to use the proxy, like an IDE with proxy settings.
fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap()
}

fn store_with_key(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
    let store = CredentialStore::new(dir.path().join("credentials.json"));
    store.save(TEST_KEY).unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn intercepted_request_is_rewritten_and_key_substituted() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/claude/v1/messages"))
        .and(header("x-api-key", TEST_KEY))
        .and(header("custom-header", "keep-me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = RewriteEngine::new(
        test_config(&upstream),
        AuthPolicy::Substitute {
            store: store_with_key(&temp),
        },
    );
    let proxy_addr = spawn_proxy(engine).await;

    let response = proxied_client(proxy_addr)
        .post("http://api.anthropic.com/v1/messages")
        .header("authorization", "Bearer old")
        .header("custom-header", "keep-me")
        .json(&serde_json::json!({"model": "claude"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    // The caller's credentials never reach the upstream
    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn pass_through_forwards_caller_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/claude/v1/models"))
        .and(header("x-api-key", "incoming-key-123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&upstream)
        .await;

    let engine = RewriteEngine::new(test_config(&upstream), AuthPolicy::PassThrough);
    let proxy_addr = spawn_proxy(engine).await;

    let response = proxied_client(proxy_addr)
        .get("http://api.anthropic.com/v1/models")
        .header("x-api-key", "incoming-key-123")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn missing_key_blocks_request_with_401() {
    let upstream = MockServer::start().await;

    let temp = tempfile::TempDir::new().unwrap();
    let empty_store = Arc::new(CredentialStore::new(temp.path().join("credentials.json")));
    let engine = RewriteEngine::new(
        test_config(&upstream),
        AuthPolicy::Substitute { store: empty_store },
    );
    let proxy_addr = spawn_proxy(engine).await;

    let response = proxied_client(proxy_addr)
        .post("http://api.anthropic.com/v1/messages")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(body["action"], "Run: chatbaz-proxy set-key");

    // Never forwarded
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_scope_host_passes_through_untouched() {
    // This stub plays an unrelated origin, not the ChatBAZ upstream
    let other = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
        .expect(1)
        .mount(&other)
        .await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = RewriteEngine::new(
        ProxyConfig::default(),
        AuthPolicy::Substitute {
            store: store_with_key(&temp),
        },
    );
    let proxy_addr = spawn_proxy(engine).await;

    let response = proxied_client(proxy_addr)
        .get(format!("http://{}/status", other.address()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "fine");

    let received = other.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    // Path untouched, no injected credentials
    assert_eq!(received[0].url.path(), "/status");
    assert!(!received[0].headers.contains_key("x-api-key"));
}

#[tokio::test]
async fn upstream_error_status_is_forwarded_verbatim() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/claude/v1/models"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(serde_json::json!({"error": "overloaded"})),
        )
        .mount(&upstream)
        .await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = RewriteEngine::new(
        test_config(&upstream),
        AuthPolicy::Substitute {
            store: store_with_key(&temp),
        },
    );
    let proxy_addr = spawn_proxy(engine).await;

    let response = proxied_client(proxy_addr)
        .get("http://api.anthropic.com/v1/models")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "overloaded");
}

#[tokio::test]
async fn already_prefixed_path_is_not_doubled() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/claude/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&upstream)
        .await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = RewriteEngine::new(
        test_config(&upstream),
        AuthPolicy::Substitute {
            store: store_with_key(&temp),
        },
    );
    let proxy_addr = spawn_proxy(engine).await;

    let response = proxied_client(proxy_addr)
        .get("http://api.anthropic.com/claude/v1/models")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
}
