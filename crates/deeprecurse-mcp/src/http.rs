use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::codec::{self, HttpResponse, ResponseEncoding};
use crate::metrics::METRICS_CONTENT_TYPE;
use crate::protocol::RpcFailure;
use crate::server::{McpServer, RpcReply};
use crate::tools::ChatQuery;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const DIRECT_QUERY_THREAD: &str = "default";

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct AppendBody {
    text: String,
    #[serde(default)]
    separator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectQueryBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    thread_id: Option<String>,
}

impl McpServer {
    /// Accept loop; every connection is handled on its own task.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, path = %self.mcp_path(), "deeprecurse http listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_http_connection(stream).await {
                            debug!(%peer, error = %err, "http connection error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "http accept error"),
            }
        }
    }

    async fn handle_http_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        let response = match read_http_request(&mut stream).await {
            Ok(Some(req)) => {
                let method = req.method.clone();
                let path = req.path.clone();
                let response = self.dispatch_http_request(req).await;
                debug!(%method, %path, status = response.status, "http request");
                response
            }
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => HttpResponse::json(
                400,
                &json!({"error": "bad_request", "message": err.to_string()}),
            ),
            Err(err) => return Err(err),
        };
        write_http_response(&mut stream, response).await
    }

    pub async fn dispatch_http_request(&self, req: HttpRequest) -> HttpResponse {
        if req.method == "OPTIONS" {
            return preflight_response();
        }

        if req.method == "GET" && req.path == "/health" {
            return HttpResponse::text(200, "text/plain; charset=utf-8", "ok");
        }

        if req.method == "GET" && req.path == "/metrics" {
            return HttpResponse::text(200, METRICS_CONTENT_TYPE, self.render_metrics_text());
        }

        if req.method == "GET" && req.path == "/metrics/summary" {
            return HttpResponse::json(200, &self.metrics_summary());
        }

        if req.path == self.mcp_path() {
            if req.method != "POST" {
                return HttpResponse::json(
                    405,
                    &json!({"error": "method_not_allowed", "message": format!("use POST {}", self.mcp_path())}),
                )
                .with_header("Allow", "POST, OPTIONS");
            }
            return self.handle_mcp_post(req).await;
        }

        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "/store/context") => self.handle_store_read(&req).await,
            ("GET", "/store/keys") => self.handle_store_keys(&req).await,
            ("POST", "/store/append") => self.handle_store_append(&req).await,
            ("POST", "/rlm") => self.handle_direct_query(&req).await,
            (
                _,
                "/store/context" | "/store/keys" | "/store/append" | "/rlm" | "/health"
                | "/metrics" | "/metrics/summary",
            ) => {
                HttpResponse::json(405, &json!({"error": "method_not_allowed"}))
            }
            _ => HttpResponse::json(
                404,
                &json!({"error": "not_found", "message": format!("use POST {}", self.mcp_path())}),
            ),
        }
    }

    async fn handle_mcp_post(&self, req: HttpRequest) -> HttpResponse {
        let encoding = ResponseEncoding::negotiate(req.header("accept"));
        match self.handle_raw(&req.body).await {
            RpcReply::Empty => HttpResponse::empty(202),
            // Batches, empty ones included, are always plain JSON.
            reply @ (RpcReply::Batch(_) | RpcReply::EmptyBatch(_)) => {
                HttpResponse::json(200, &reply)
            }
            reply @ RpcReply::Single(_) => {
                let status = if reply.is_parse_error() { 400 } else { 200 };
                codec::encode(encoding, status, &reply)
            }
        }
    }

    async fn handle_store_read(&self, req: &HttpRequest) -> HttpResponse {
        let Some(key) = req.query.get("key").filter(|k| !k.is_empty()) else {
            return missing_key_response();
        };
        match self.store().read(key).await {
            Ok(context) => HttpResponse::json(200, &json!({"context": context})),
            Err(err) => {
                warn!(key = %key, error = %err, "store read failed");
                HttpResponse::json(500, &json!({"error": err.to_string()}))
            }
        }
    }

    async fn handle_store_keys(&self, req: &HttpRequest) -> HttpResponse {
        let prefix = req.query.get("prefix").map_or("", String::as_str);
        match self.store().list(prefix).await {
            Ok(keys) => HttpResponse::json(200, &json!({"keys": keys})),
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "store list failed");
                HttpResponse::json(500, &json!({"error": err.to_string()}))
            }
        }
    }

    async fn handle_store_append(&self, req: &HttpRequest) -> HttpResponse {
        let Some(key) = req.query.get("key").filter(|k| !k.is_empty()) else {
            return missing_key_response();
        };
        let body: AppendBody = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(err) => {
                return HttpResponse::json(400, &json!({"error": format!("invalid body: {err}")}))
            }
        };
        let separator = body.separator.as_deref().unwrap_or("");
        match self.store().append_separated(key, separator, &body.text).await {
            Ok(()) => HttpResponse::json(200, &json!({"ok": true})),
            Err(err) => {
                warn!(key = %key, error = %err, "store append failed");
                HttpResponse::json(500, &json!({"ok": false, "error": err.to_string()}))
            }
        }
    }

    async fn handle_direct_query(&self, req: &HttpRequest) -> HttpResponse {
        let body: DirectQueryBody = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(err) => {
                return HttpResponse::json(400, &json!({"error": format!("invalid body: {err}")}))
            }
        };
        let query = body.query.trim();
        if query.is_empty() {
            return HttpResponse::json(400, &json!({"error": "query is required"}));
        }
        let thread_id = body
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DIRECT_QUERY_THREAD);

        let chat = ChatQuery {
            query: query.to_string(),
            thread_id: thread_id.to_string(),
        };
        match self.chat(&chat).await {
            Ok(answer) => HttpResponse::json(200, &json!({"answer": answer})),
            Err(RpcFailure::Internal(message)) => {
                HttpResponse::json(500, &json!({"error": message}))
            }
            Err(other) => HttpResponse::json(400, &json!({"error": other.to_string()})),
        }
    }
}

fn missing_key_response() -> HttpResponse {
    HttpResponse::json(
        400,
        &json!({"error": "invalid_request", "message": "missing query param: key"}),
    )
}

fn preflight_response() -> HttpResponse {
    HttpResponse::empty(204)
        .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .with_header(
            "Access-Control-Allow-Headers",
            "Content-Type, Accept, Mcp-Session-Id, Mcp-Protocol-Version",
        )
        .with_header("Access-Control-Max-Age", "86400")
}

pub async fn read_http_request<S>(stream: &mut S) -> io::Result<Option<HttpRequest>>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut header_budget = MAX_HEADER_BYTES;

    let Some(line) = read_header_line(&mut reader, &mut header_budget).await? else {
        return Ok(None);
    };
    let first = line.trim_end_matches(['\r', '\n']);
    if first.is_empty() {
        return Ok(None);
    }

    let mut parts = first.split_whitespace();
    let Some(method) = parts.next().map(str::to_ascii_uppercase) else {
        return Err(invalid_data("invalid http request line (missing method)"));
    };
    let Some(path_with_query) = parts.next() else {
        return Err(invalid_data("invalid http request line (missing path)"));
    };
    let (path, query) = parse_path_query(path_with_query);

    let mut content_length = 0usize;
    let mut headers = HashMap::new();
    while let Some(header) = read_header_line(&mut reader, &mut header_budget).await? {
        let header = header.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" {
                content_length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid_data("invalid content-length"))?;
            }
            headers.insert(name, value.trim().to_string());
        }
    }

    if headers.contains_key("transfer-encoding") {
        return Err(invalid_data("chunked request bodies are not supported"));
    }
    if content_length > MAX_BODY_BYTES {
        return Err(invalid_data("request body too large"));
    }

    let mut body = vec![0_u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(Some(HttpRequest {
        method,
        path,
        query,
        headers,
        body,
    }))
}

/// Reads one line without buffering past what is left of the header
/// budget. `None` means the peer closed before sending anything.
async fn read_header_line<R>(reader: &mut R, budget: &mut usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(*budget).unwrap_or(u64::MAX);
    let mut raw = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return if *budget == 0 {
            Err(invalid_data("http headers too large"))
        } else {
            Ok(None)
        };
    }
    *budget = budget.saturating_sub(n);
    if !raw.ends_with(b"\n") && *budget == 0 {
        return Err(invalid_data("http headers too large"));
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| invalid_data("http headers are not utf-8"))
}

pub async fn write_http_response(
    stream: &mut TcpStream,
    response: HttpResponse,
) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\nAccess-Control-Allow-Origin: *\r\n",
        response.status,
        http_reason_phrase(response.status),
        response.content_type,
    );
    if !response.streaming {
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    stream.shutdown().await
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn http_reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

fn parse_path_query(raw: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = match raw.split_once('?') {
        Some((p, q)) => (p.to_string(), q),
        None => (raw.to_string(), ""),
    };
    let mut query = HashMap::new();
    for pair in query_str.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(decode_component(k), decode_component(v));
    }
    (path, query)
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|v| v.into_owned())
        .unwrap_or(spaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_components_are_percent_decoded() {
        let (path, query) = parse_path_query("/store/context?key=transcripts%2Fs1&flag");
        assert_eq!(path, "/store/context");
        assert_eq!(query.get("key").map(String::as_str), Some("transcripts/s1"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn plus_decodes_to_space() {
        assert_eq!(decode_component("my+thread"), "my thread");
    }

    #[tokio::test]
    async fn request_with_headers_and_body_is_parsed() {
        let raw = b"POST /mcp?x=1 HTTP/1.1\r\nAccept: text/event-stream\r\nContent-Length: 2\r\n\r\n{}";
        let mut input: &[u8] = raw;
        let req = read_http_request(&mut input)
            .await
            .expect("read")
            .expect("request");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/mcp");
        assert_eq!(req.header("accept"), Some("text/event-stream"));
        assert_eq!(req.body, b"{}");
    }

    #[tokio::test]
    async fn header_line_without_newline_stops_at_limit() {
        let mut raw = b"GET /health HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.resize(raw.len() + MAX_HEADER_BYTES * 4, b'a');
        let mut input: &[u8] = &raw;
        let err = read_http_request(&mut input).await.expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // The oversized line was not drained into memory.
        assert!(input.len() >= MAX_HEADER_BYTES * 2);
    }

    #[tokio::test]
    async fn many_small_headers_share_one_budget() {
        let mut raw = b"GET /health HTTP/1.1\r\n".to_vec();
        for i in 0..(MAX_HEADER_BYTES / 16 + 1) {
            raw.extend(format!("X-H{i:05}: vvvv\r\n").as_bytes());
        }
        raw.extend(b"\r\n");
        let mut input: &[u8] = &raw;
        let err = read_http_request(&mut input).await.expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn closed_connection_yields_no_request() {
        let mut input: &[u8] = b"";
        assert!(read_http_request(&mut input).await.expect("read").is_none());
    }
}
