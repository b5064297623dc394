use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use deeprecurse_sandbox::{BackendCall, BackendStats, ReasoningBackend};
use deeprecurse_store::ContextStore;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::metrics::MetricsRegistry;
use crate::protocol::{
    InitializeParams, JsonRpcRequest, JsonRpcResponse, RpcFailure, RpcMethod, ToolsCallParams,
    INVALID_REQUEST, PARSE_ERROR,
};
use crate::tools::{
    format_turn, format_upload_block, listing_summary, tools_list_result, upload_confirmation,
    ChatQuery, ToolInvocation, TranscriptListing, TranscriptUpload, TURN_SEPARATOR,
};
use crate::transcript::parse_transcript;

const DEFAULT_MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_MCP_PATH: &str = "/mcp";

/// Stateless dispatcher: every request is routed on its own, no session is
/// created or checked.
pub struct McpServer {
    store: Arc<dyn ContextStore>,
    backend: Arc<dyn ReasoningBackend>,
    metrics: MetricsRegistry,
    mcp_path: String,
}

/// What a decoded message produces: one envelope, an array for a batch, or
/// nothing when only notifications were sent. An empty batch `[]` is
/// answered with one error envelope but is still framed like a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RpcReply {
    Single(JsonRpcResponse),
    Batch(Vec<JsonRpcResponse>),
    EmptyBatch(JsonRpcResponse),
    Empty,
}

impl RpcReply {
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::Single(resp) if resp.error_code() == Some(PARSE_ERROR))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub key: String,
    pub session_id: String,
    pub developer: String,
    pub thread_id: String,
    pub turns: usize,
    pub message: String,
}

impl McpServer {
    pub fn new(store: Arc<dyn ContextStore>, backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            store,
            backend,
            metrics: MetricsRegistry::default(),
            mcp_path: DEFAULT_MCP_PATH.to_string(),
        }
    }

    pub fn with_mcp_path(mut self, path: impl Into<String>) -> Self {
        self.mcp_path = path.into();
        self
    }

    pub fn mcp_path(&self) -> &str {
        &self.mcp_path
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub fn backend_stats(&self) -> BackendStats {
        self.backend.stats()
    }

    pub fn render_metrics_text(&self) -> String {
        self.metrics.render_text(&self.backend_stats())
    }

    pub fn metrics_summary(&self) -> Value {
        self.metrics.render_summary(&self.backend_stats())
    }

    /// Decodes a raw body and dispatches it. Malformed JSON still yields a
    /// valid error envelope.
    pub async fn handle_raw(&self, body: &[u8]) -> RpcReply {
        match serde_json::from_slice::<Value>(body) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => RpcReply::Single(JsonRpcResponse::failure(
                Value::Null,
                &RpcFailure::Parse(err.to_string()),
            )),
        }
    }

    /// Batches run strictly in order, one envelope at a time; a failing
    /// envelope never aborts its siblings.
    pub async fn handle_message(&self, message: Value) -> RpcReply {
        match message {
            Value::Array(items) => {
                if items.is_empty() {
                    return RpcReply::EmptyBatch(JsonRpcResponse::error(
                        Value::Null,
                        INVALID_REQUEST,
                        "invalid request: empty batch",
                    ));
                }
                let mut replies = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(resp) = self.handle_value(item).await {
                        replies.push(resp);
                    }
                }
                if replies.is_empty() {
                    RpcReply::Empty
                } else {
                    RpcReply::Batch(replies)
                }
            }
            other => match self.handle_value(other).await {
                Some(resp) => RpcReply::Single(resp),
                None => RpcReply::Empty,
            },
        }
    }

    async fn handle_value(&self, value: Value) -> Option<JsonRpcResponse> {
        match JsonRpcRequest::from_value(value) {
            Ok(request) => self.handle_request(request).await,
            Err(resp) => Some(resp),
        }
    }

    /// Returns `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.is_notification();
        let id = request.id.clone().unwrap_or(Value::Null);

        let method = match RpcMethod::parse(&request.method, request.params) {
            Ok(method) => method,
            Err(failure) => {
                if is_notification {
                    debug!(method = %request.method, error = %failure, "dropping notification");
                    return None;
                }
                return Some(JsonRpcResponse::failure(id, &failure));
            }
        };

        let response = match method {
            RpcMethod::Initialize(params) => {
                JsonRpcResponse::success(id, initialize_result(&params))
            }
            RpcMethod::Initialized => JsonRpcResponse::success(id, json!({})),
            RpcMethod::Ping => JsonRpcResponse::success(id, json!({})),
            RpcMethod::ResourcesList => JsonRpcResponse::success(id, json!({"resources": []})),
            RpcMethod::PromptsList => JsonRpcResponse::success(id, json!({"prompts": []})),
            RpcMethod::ToolsList => JsonRpcResponse::success(id, tools_list_result()),
            RpcMethod::ToolsCall(params) => self.handle_tools_call(id, params).await,
        };

        if is_notification {
            None
        } else {
            Some(response)
        }
    }

    async fn handle_tools_call(&self, id: Value, params: ToolsCallParams) -> JsonRpcResponse {
        let invocation = match ToolInvocation::parse(&params.name, params.arguments) {
            Ok(v) => v,
            Err(failure) => return JsonRpcResponse::failure(id, &failure),
        };

        let start = Instant::now();
        let tool = invocation.name();
        let outcome = match invocation {
            ToolInvocation::ChatRlmQuery(query) => self.chat(&query).await.map(|answer| {
                json!({
                    "content": [{"type": "text", "text": answer}],
                    "structuredContent": {
                        "answer": answer,
                        "thread_id": query.thread_id
                    }
                })
            }),
            ToolInvocation::UploadContext(upload) => self.upload(&upload).await.map(|receipt| {
                json!({
                    "content": [{"type": "text", "text": receipt.message}],
                    "structuredContent": receipt
                })
            }),
            ToolInvocation::ListTranscripts(listing) => {
                self.list_transcripts(&listing).await.map(|sessions| {
                    json!({
                        "content": [{"type": "text", "text": listing_summary(&listing, &sessions)}],
                        "structuredContent": {
                            "thread_id": listing.thread_id,
                            "sessions": sessions
                        }
                    })
                })
            }
        };

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_tool(tool, latency_ms, outcome.is_err());
        match outcome {
            Ok(result) => {
                info!(tool, latency_ms, "tool call completed");
                JsonRpcResponse::success(id, result)
            }
            Err(failure) => {
                warn!(tool, latency_ms, error = %failure, "tool call failed");
                JsonRpcResponse::failure(id, &failure)
            }
        }
    }

    /// Read, answer, then append. The turn is only written after the backend
    /// answered; a turn that cannot be persisted fails the call. Whether the
    /// turn needs a leading separator is decided by the store under the
    /// thread's lock, so concurrent first turns still come out separated.
    pub async fn chat(&self, query: &ChatQuery) -> Result<String, RpcFailure> {
        let context = self.store.read(&query.thread_id).await?;
        debug!(
            thread_id = %query.thread_id,
            context_bytes = context.len(),
            "forwarding query to backend"
        );

        let answer = self
            .backend
            .call(BackendCall::new(context, &query.query, &query.thread_id))
            .await?;

        let turn = format_turn(&query.query, &answer);
        if let Err(err) = self
            .store
            .append_separated(&query.thread_id, TURN_SEPARATOR, &turn)
            .await
        {
            warn!(
                thread_id = %query.thread_id,
                answer_bytes = answer.len(),
                error = %err,
                "answer computed but turn was not persisted"
            );
            return Err(RpcFailure::Internal(format!(
                "answer computed but failed to persist turn: {err}"
            )));
        }
        Ok(answer)
    }

    pub async fn upload(&self, upload: &TranscriptUpload) -> Result<UploadReceipt, RpcFailure> {
        let key = upload.storage_key();
        let turns = parse_transcript(&upload.transcript).len();
        let block = format_upload_block(upload, turns, now_ms());
        self.store.append(&key, &block).await?;
        info!(key = %key, turns, developer = %upload.developer, "transcript uploaded");
        Ok(UploadReceipt {
            key,
            session_id: upload.session_id.clone(),
            developer: upload.developer.clone(),
            thread_id: upload.thread_id.clone(),
            turns,
            message: upload_confirmation(upload, turns),
        })
    }

    /// Session ids stored under the listing's thread, sorted.
    pub async fn list_transcripts(
        &self,
        listing: &TranscriptListing,
    ) -> Result<Vec<String>, RpcFailure> {
        let prefix = listing.prefix();
        let keys = self.store.list(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    /// Newline-delimited JSON-RPC over stdin/stdout.
    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let reply = self.handle_raw(trimmed.as_bytes()).await;
            if matches!(reply, RpcReply::Empty) {
                continue;
            }
            let mut out = serde_json::to_vec(&reply)?;
            out.push(b'\n');
            stdout.write_all(&out).await?;
            stdout.flush().await?;
        }

        Ok(())
    }
}

fn initialize_result(params: &InitializeParams) -> Value {
    let protocol_version = params
        .protocol_version
        .as_deref()
        .unwrap_or(DEFAULT_MCP_PROTOCOL_VERSION);
    json!({
        "protocolVersion": protocol_version,
        "serverInfo": {"name": "deeprecurse-mcp", "version": env!("CARGO_PKG_VERSION")},
        "capabilities": {
            "tools": {"listChanged": false},
            "resources": {"subscribe": false, "listChanged": false},
            "prompts": {"listChanged": false}
        },
        "instructions": "Use chat_rlm_query to answer questions with the shared history of a \
                         thread; use upload_context to add session transcripts and list_transcripts to \
                         see which sessions a thread holds."
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
