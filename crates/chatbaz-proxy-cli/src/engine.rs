//! Plain-HTTP forwarding front end.
//!
//! Accepts forward-proxy connections on the loopback interface, parses one
//! request head per connection, and drives the rewrite hooks around an
//! upstream call made with `reqwest`. `CONNECT` requests are tunneled blind
//! with a bidirectional copy; TLS interception is out of scope, so traffic
//! inside a tunnel is never rewritten.
//!
//! A failure while handling one connection is logged and dropped with that
//! connection; the accept loop itself never stops.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use http::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use chatbaz_proxy::{Flow, FlowResponse, Headers, RewriteEngine};

/// Maximum size of a request head (request line plus headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum buffered request body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const MAX_HEADERS: usize = 64;

/// Headers that describe the client connection rather than the request, and
/// must not travel upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Loopback proxy listener wired to a [`RewriteEngine`].
pub struct ProxyServer {
    listener: TcpListener,
    hooks: Arc<RewriteEngine>,
    client: reqwest::Client,
}

impl ProxyServer {
    /// Binds the listener on the loopback interface.
    ///
    /// Port 0 picks an ephemeral port; see [`ProxyServer::local_addr`].
    pub async fn bind(port: u16, hooks: Arc<RewriteEngine>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind 127.0.0.1:{port}"))?;

        // Redirects are the caller's business; forward responses verbatim
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            listener,
            hooks,
            client,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let hooks = Arc::clone(&self.hooks);
                    let client = self.client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, hooks, client).await {
                            debug!("Connection from {peer} ended with error: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {e}");
                }
            }
        }
    }
}

struct RequestHead {
    method: String,
    target: String,
    headers: Headers,
    head_len: usize,
}

/// Handles one proxied exchange, then closes the connection.
async fn handle_connection(
    mut stream: TcpStream,
    hooks: Arc<RewriteEngine>,
    client: reqwest::Client,
) -> Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let head = match read_request_head(&mut stream, &mut buf).await {
        Ok(head) => head,
        Err(e) => {
            write_plain_response(&mut stream, 400, "Bad Request", "malformed request head").await?;
            return Err(e);
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        return tunnel(stream, &head.target).await;
    }

    let Some((scheme, host, port, path)) = resolve_target(&head) else {
        write_plain_response(&mut stream, 400, "Bad Request", "unresolvable request target")
            .await?;
        bail!("unresolvable request target: {}", head.target);
    };

    if head
        .headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        write_plain_response(
            &mut stream,
            501,
            "Not Implemented",
            "chunked request bodies are not supported",
        )
        .await?;
        bail!("chunked request body");
    }

    let body = match read_body(&mut stream, &head, &buf).await {
        Ok(body) => body,
        Err(e) => {
            write_plain_response(&mut stream, 400, "Bad Request", "unreadable request body")
                .await?;
            return Err(e);
        }
    };

    let mut flow = Flow::new(&scheme, &host, port, &path, head.headers);
    hooks.on_request(&mut flow);

    // The request hook short-circuits by attaching a response
    if let Some(response) = flow.response.take() {
        hooks.on_response(&mut flow);
        return write_flow_response(&mut stream, &response).await;
    }

    let url = format!(
        "{}://{}:{}{}",
        flow.scheme, flow.host, flow.port, flow.path
    );
    let method = reqwest::Method::from_bytes(head.method.as_bytes())
        .with_context(|| format!("Invalid method {:?}", head.method))?;

    let mut request = client.request(method, &url);
    for (name, value) in flow.headers.iter() {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        request = request.header(name, value);
    }
    request = request.body(body);

    match request.send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let mut headers = Headers::new();
            for (name, value) in upstream.headers() {
                match value.to_str() {
                    Ok(value) => headers.append(name.as_str(), value),
                    Err(_) => warn!("Dropping non-UTF-8 response header {name}"),
                }
            }

            flow.response = Some(FlowResponse {
                status: status.as_u16(),
                headers,
                body: Vec::new(),
            });
            hooks.on_response(&mut flow);

            relay_upstream(&mut stream, &flow, upstream).await
        }
        Err(e) => {
            error!("Upstream request to {url} failed: {e}");
            // No response attached: the hook stays silent for this flow
            hooks.on_response(&mut flow);
            write_plain_response(&mut stream, 502, "Bad Gateway", "upstream request failed").await
        }
    }
}

/// Reads until the request head parses completely; leftover bytes stay in
/// `buf` past the returned head length.
async fn read_request_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<RequestHead> {
    loop {
        let mut chunk = [0u8; 4096];
        let n = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request")?;
        if n == 0 {
            bail!("connection closed before request head was complete");
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEAD_BYTES {
            bail!("request head exceeds {MAX_HEAD_BYTES} bytes");
        }

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_storage);
        match parsed.parse(buf).context("Invalid HTTP request head")? {
            httparse::Status::Partial => {}
            httparse::Status::Complete(head_len) => {
                let method = parsed
                    .method
                    .context("Missing HTTP method")?
                    .to_string();
                let target = parsed
                    .path
                    .context("Missing request target")?
                    .to_string();

                let mut headers = Headers::new();
                for header in parsed.headers.iter() {
                    match std::str::from_utf8(header.value) {
                        Ok(value) => headers.append(header.name, value),
                        Err(_) => warn!("Dropping non-UTF-8 request header {}", header.name),
                    }
                }

                return Ok(RequestHead {
                    method,
                    target,
                    headers,
                    head_len,
                });
            }
        }
    }
}

/// Resolves scheme, host, port, and path from the request target.
///
/// Forward proxies receive absolute-form targets; origin-form falls back to
/// the `Host` header, which makes the listener usable as a plain reverse
/// proxy in tests.
fn resolve_target(head: &RequestHead) -> Option<(String, String, u16, String)> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        let uri: Uri = head.target.parse().ok()?;
        let scheme = uri.scheme_str()?.to_string();
        let host = uri.host()?.to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
        return Some((scheme, host, port, path));
    }

    let host_header = head.headers.get("host")?;
    let (host, port) = match host_header.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()?),
        None => (host_header.to_string(), 80),
    };
    Some(("http".to_string(), host, port, head.target.clone()))
}

/// Buffers the request body according to `Content-Length`.
async fn read_body(stream: &mut TcpStream, head: &RequestHead, buf: &[u8]) -> Result<Vec<u8>> {
    let content_length = match head.headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .context("Invalid Content-Length")?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        bail!("request body of {content_length} bytes exceeds limit");
    }

    let mut body = buf.get(head.head_len..).unwrap_or_default().to_vec();
    body.truncate(content_length);
    while body.len() < content_length {
        let mut chunk = [0u8; 8192];
        let n = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request body")?;
        if n == 0 {
            bail!("connection closed mid-body");
        }
        let wanted = (content_length - body.len()).min(n);
        body.extend_from_slice(&chunk[..wanted]);
    }
    Ok(body)
}

/// Relays the upstream response, streaming the body.
///
/// Uses the upstream `Content-Length` when present, otherwise re-frames the
/// body with chunked encoding.
async fn relay_upstream(
    stream: &mut TcpStream,
    flow: &Flow,
    upstream: reqwest::Response,
) -> Result<()> {
    let Some(response) = &flow.response else {
        bail!("relay called without a response on the flow");
    };

    let mut head = status_line(response.status);
    let mut has_length = false;
    for (name, value) in response.headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("Connection: close\r\n");
    if !has_length {
        head.push_str("Transfer-Encoding: chunked\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    let mut body = upstream.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Failed to read upstream body")?;
        if has_length {
            stream.write_all(&chunk).await?;
        } else {
            stream
                .write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                .await?;
            stream.write_all(&chunk).await?;
            stream.write_all(b"\r\n").await?;
        }
    }
    if !has_length {
        stream.write_all(b"0\r\n\r\n").await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Writes a synthesized response (blocked request) back to the client.
async fn write_flow_response(stream: &mut TcpStream, response: &FlowResponse) -> Result<()> {
    let mut head = status_line(response.status);
    for (name, value) in response.headers.iter() {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    Ok(())
}

/// Writes a minimal plain-text error response.
async fn write_plain_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    message: &str,
) -> Result<()> {
    let payload = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{message}",
        message.len()
    );
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Establishes a blind tunnel for a CONNECT request.
async fn tunnel(mut stream: TcpStream, target: &str) -> Result<()> {
    debug!("Tunneling CONNECT {target}");
    let mut upstream = match TcpStream::connect(target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            write_plain_response(&mut stream, 502, "Bad Gateway", "tunnel connect failed").await?;
            return Err(e).with_context(|| format!("Failed to connect tunnel to {target}"));
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    copy_bidirectional(&mut stream, &mut upstream)
        .await
        .context("Tunnel copy failed")?;
    Ok(())
}

fn status_line(status: u16) -> String {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");
    format!("HTTP/1.1 {status} {reason}\r\n")
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn head(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            headers: headers.iter().copied().collect(),
            head_len: 0,
        }
    }

    #[test]
    fn test_resolve_absolute_form() {
        let head = head("GET", "http://api.anthropic.com/v1/models?limit=5", &[]);
        let (scheme, host, port, path) = resolve_target(&head).unwrap();
        assert_eq!(scheme, "http");
        assert_eq!(host, "api.anthropic.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/v1/models?limit=5");
    }

    #[test]
    fn test_resolve_absolute_form_https_default_port() {
        let head = head("GET", "https://api.anthropic.com/v1/models", &[]);
        let (_, _, port, _) = resolve_target(&head).unwrap();
        assert_eq!(port, 443);
    }

    #[test]
    fn test_resolve_origin_form_uses_host_header() {
        let head = head("POST", "/v1/messages", &[("Host", "api.anthropic.com:8080")]);
        let (scheme, host, port, path) = resolve_target(&head).unwrap();
        assert_eq!(scheme, "http");
        assert_eq!(host, "api.anthropic.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/v1/messages");
    }

    #[test]
    fn test_resolve_origin_form_without_host_fails() {
        let head = head("GET", "/v1/messages", &[]);
        assert!(resolve_target(&head).is_none());
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("x-api-key"));
    }
}
