use serde::Deserialize;
use serde_json::{json, Value};

use crate::protocol::RpcFailure;

pub const CHAT_RLM_QUERY: &str = "chat_rlm_query";
pub const UPLOAD_CONTEXT: &str = "upload_context";
pub const LIST_TRANSCRIPTS: &str = "list_transcripts";

pub const DEFAULT_TRANSCRIPT_THREAD: &str = "transcripts";
pub const DEFAULT_DEVELOPER: &str = "unknown";

/// Written between turns of a thread, never before the first one.
pub const TURN_SEPARATOR: &str = "\n";

const BLOCK_RULE_WIDTH: usize = 72;

pub struct ToolParam {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ToolParam],
}

impl ToolDescriptor {
    pub fn to_json(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for param in self.params {
            properties.insert(
                param.name.to_string(),
                json!({"type": "string", "description": param.description}),
            );
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": {
                "type": "object",
                "properties": properties,
                "required": required
            }
        })
    }
}

pub fn tool_descriptors() -> &'static [ToolDescriptor] {
    const TOOLS: &[ToolDescriptor] = &[
        ToolDescriptor {
            name: CHAT_RLM_QUERY,
            description: "Ask the recursive reasoning backend a question with the full shared \
                          history of a thread. The exchange is appended to the thread.",
            params: &[
                ToolParam {
                    name: "query",
                    description: "Question to answer.",
                    required: true,
                },
                ToolParam {
                    name: "thread_id",
                    description: "Conversation thread whose history is used and extended.",
                    required: true,
                },
            ],
        },
        ToolDescriptor {
            name: UPLOAD_CONTEXT,
            description: "Store a session transcript under thread_id/session_id so later \
                          queries can draw on it.",
            params: &[
                ToolParam {
                    name: "transcript",
                    description: "Raw transcript text (USER:/ASSISTANT: lines).",
                    required: true,
                },
                ToolParam {
                    name: "session_id",
                    description: "Session identifier.",
                    required: true,
                },
                ToolParam {
                    name: "thread_id",
                    description: "Thread to file the transcript under (default: transcripts).",
                    required: false,
                },
                ToolParam {
                    name: "developer",
                    description: "Who produced the session (default: unknown).",
                    required: false,
                },
            ],
        },
        ToolDescriptor {
            name: LIST_TRANSCRIPTS,
            description: "List the session ids of transcripts uploaded under a thread.",
            params: &[ToolParam {
                name: "thread_id",
                description: "Thread to list (default: transcripts).",
                required: false,
            }],
        },
    ];
    TOOLS
}

pub fn tools_list_result() -> Value {
    json!({
        "tools": tool_descriptors().iter().map(ToolDescriptor::to_json).collect::<Vec<_>>()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    ChatRlmQuery(ChatQuery),
    UploadContext(TranscriptUpload),
    ListTranscripts(TranscriptListing),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatQuery {
    pub query: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptUpload {
    pub transcript: String,
    pub session_id: String,
    pub thread_id: String,
    pub developer: String,
}

impl TranscriptUpload {
    pub fn storage_key(&self) -> String {
        format!("{}{}", session_prefix(&self.thread_id), self.session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptListing {
    pub thread_id: String,
}

impl TranscriptListing {
    pub fn prefix(&self) -> String {
        session_prefix(&self.thread_id)
    }
}

fn session_prefix(thread_id: &str) -> String {
    format!("{thread_id}/")
}

#[derive(Debug, Default, Deserialize)]
struct ChatQueryArgs {
    query: Option<String>,
    thread_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UploadContextArgs {
    transcript: Option<String>,
    session_id: Option<String>,
    thread_id: Option<String>,
    developer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListTranscriptsArgs {
    thread_id: Option<String>,
}

impl ToolInvocation {
    pub fn parse(name: &str, arguments: Option<Value>) -> Result<Self, RpcFailure> {
        match name {
            CHAT_RLM_QUERY => {
                let args: ChatQueryArgs = parse_args(arguments)?;
                Ok(Self::ChatRlmQuery(ChatQuery {
                    query: required(args.query, "query")?,
                    thread_id: required(args.thread_id, "thread_id")?,
                }))
            }
            UPLOAD_CONTEXT => {
                let args: UploadContextArgs = parse_args(arguments)?;
                Ok(Self::UploadContext(TranscriptUpload {
                    transcript: required(args.transcript, "transcript")?,
                    session_id: required(args.session_id, "session_id")?,
                    thread_id: or_default(args.thread_id, DEFAULT_TRANSCRIPT_THREAD),
                    developer: or_default(args.developer, DEFAULT_DEVELOPER),
                }))
            }
            LIST_TRANSCRIPTS => {
                let args: ListTranscriptsArgs = parse_args(arguments)?;
                Ok(Self::ListTranscripts(TranscriptListing {
                    thread_id: or_default(args.thread_id, DEFAULT_TRANSCRIPT_THREAD),
                }))
            }
            other => Err(RpcFailure::InvalidParams(format!("unknown tool: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatRlmQuery(_) => CHAT_RLM_QUERY,
            Self::UploadContext(_) => UPLOAD_CONTEXT,
            Self::ListTranscripts(_) => LIST_TRANSCRIPTS,
        }
    }
}

fn parse_args<T: for<'de> Deserialize<'de> + Default>(
    arguments: Option<Value>,
) -> Result<T, RpcFailure> {
    match arguments {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v)
            .map_err(|err| RpcFailure::InvalidParams(format!("invalid tool arguments: {err}"))),
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, RpcFailure> {
    let trimmed = value.as_deref().map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(RpcFailure::InvalidParams(format!("{field} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn or_default(value: Option<String>, default: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

/// One exchange as stored in a thread log. The store prepends
/// `TURN_SEPARATOR` when the thread already has history.
pub fn format_turn(query: &str, answer: &str) -> String {
    format!("USER: {query}\nASSISTANT: {answer}\n")
}

pub fn format_upload_block(
    upload: &TranscriptUpload,
    turn_count: usize,
    uploaded_at_ms: u64,
) -> String {
    let rule = "=".repeat(BLOCK_RULE_WIDTH);
    format!(
        "{rule}\nSESSION UPLOAD: {session}\ndeveloper: {developer}\nthread: {thread}\nturns: {turn_count}\nuploaded_at_ms: {uploaded_at_ms}\n{rule}\n{transcript}\n",
        session = upload.session_id,
        developer = upload.developer,
        thread = upload.thread_id,
        transcript = upload.transcript,
    )
}

pub fn listing_summary(listing: &TranscriptListing, sessions: &[String]) -> String {
    if sessions.is_empty() {
        format!("No transcripts stored under thread {}", listing.thread_id)
    } else {
        format!(
            "{} transcript(s) under thread {}: {}",
            sessions.len(),
            listing.thread_id,
            sessions.join(", ")
        )
    }
}

pub fn upload_confirmation(upload: &TranscriptUpload, turn_count: usize) -> String {
    format!(
        "Uploaded transcript for session {} (developer: {}, {turn_count} turns) to thread {}",
        upload.session_id, upload.developer, upload.thread_id
    )
}
