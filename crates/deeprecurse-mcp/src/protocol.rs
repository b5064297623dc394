use deeprecurse_sandbox::BackendError;
use deeprecurse_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Validates the envelope shape of one decoded message. Failures come
    /// back as ready-to-send `InvalidRequest` responses.
    pub fn from_value(value: Value) -> Result<Self, JsonRpcResponse> {
        let Value::Object(mut obj) = value else {
            return Err(JsonRpcResponse::failure(
                Value::Null,
                &RpcFailure::InvalidRequest("request must be a JSON object".to_string()),
            ));
        };

        // Only an absent id marks a notification; `null` is answered.
        let id = match obj.remove("id") {
            None => None,
            Some(id @ (Value::Null | Value::String(_) | Value::Number(_))) => Some(id),
            Some(_) => {
                return Err(JsonRpcResponse::failure(
                    Value::Null,
                    &RpcFailure::InvalidRequest("id must be a string or number".to_string()),
                ))
            }
        };
        let reply_id = id.clone().unwrap_or(Value::Null);

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(JsonRpcResponse::failure(
                reply_id,
                &RpcFailure::InvalidRequest("jsonrpc must be \"2.0\"".to_string()),
            ));
        }

        let method = match obj.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => {
                return Err(JsonRpcResponse::failure(
                    reply_id,
                    &RpcFailure::InvalidRequest("method is required".to_string()),
                ))
            }
        };

        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method,
            params: obj.remove("params").unwrap_or(Value::Null),
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn failure(id: Value, failure: &RpcFailure) -> Self {
        Self::error(id, failure.code(), failure.to_string())
    }

    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Every way a request can fail, mapped one-to-one onto JSON-RPC codes.
#[derive(Debug, Error)]
pub enum RpcFailure {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Internal(String),
}

impl RpcFailure {
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }
}

impl From<StoreError> for RpcFailure {
    fn from(err: StoreError) -> Self {
        Self::Internal(format!("context store error: {err}"))
    }
}

impl From<BackendError> for RpcFailure {
    fn from(err: BackendError) -> Self {
        Self::Internal(format!("backend error: {err}"))
    }
}

/// The methods this gateway understands, each with its decoded params.
#[derive(Debug, Clone)]
pub enum RpcMethod {
    Initialize(InitializeParams),
    Initialized,
    Ping,
    ResourcesList,
    PromptsList,
    ToolsList,
    ToolsCall(ToolsCallParams),
}

impl RpcMethod {
    pub fn parse(method: &str, params: Value) -> Result<Self, RpcFailure> {
        match method {
            "initialize" => Ok(Self::Initialize(parse_params_optional(params)?)),
            "notifications/initialized" => Ok(Self::Initialized),
            "ping" => Ok(Self::Ping),
            "resources/list" => Ok(Self::ResourcesList),
            "prompts/list" => Ok(Self::PromptsList),
            "tools/list" => Ok(Self::ToolsList),
            "tools/call" => {
                if params.is_null() {
                    return Err(RpcFailure::InvalidParams(
                        "missing params for tools/call".to_string(),
                    ));
                }
                let parsed = serde_json::from_value(params)
                    .map_err(|err| RpcFailure::InvalidParams(format!("tools/call: {err}")))?;
                Ok(Self::ToolsCall(parsed))
            }
            other => Err(RpcFailure::MethodNotFound(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

fn parse_params_optional<T: for<'de> Deserialize<'de> + Default>(
    params: Value,
) -> Result<T, RpcFailure> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|err| RpcFailure::InvalidParams(err.to_string()))
}
