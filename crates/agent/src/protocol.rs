//! Enforcement agent protocol types (JSON-RPC 2.0, newline delimited).

use policy::{AccessRequest, AccessType, Decision};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Protocol revision sent during the handshake.
pub const PROTOCOL_VERSION: &str = "2019-09-13";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const REGISTER: &str = "register";
    pub const RESOLVE: &str = "resolve";
    pub const INVALIDATED: &str = "invalidated";
}

/// Standard JSON-RPC error code for unknown methods.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: impl Serialize) -> Self {
        self.params = Some(serde_json::to_value(params).unwrap_or(Value::Null));
        self
    }
}

/// JSON-RPC 2.0 notification (no id, no reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: impl Serialize) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: serde_json::to_value(params).ok(),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: impl Serialize) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns the result if successful, or an error.
    ///
    /// A missing `result` on success is treated as `null`.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code;
        let message = &self.message;
        write!(f, "[{code}] {message}")
    }
}

impl std::error::Error for JsonRpcError {}

/// Request ID (can be string or number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Any message read off the channel, before it is classified.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawMessage {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A classified incoming message.
#[derive(Debug)]
pub(crate) enum Incoming {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl RawMessage {
    pub fn classify(self) -> Option<Incoming> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Some(Incoming::Request(JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id,
                method,
                params: self.params,
            })),
            (None, Some(method)) => Some(Incoming::Notification(JsonRpcNotification {
                jsonrpc: "2.0".to_string(),
                method,
                params: self.params,
            })),
            (Some(id), None) => Some(Incoming::Response(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: self.result,
                error: self.error,
            })),
            (None, None) => None,
        }
    }
}

// --- Agent-specific types ---

/// `initialize` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: PeerInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_info: PeerInfo {
                name: "fileguard".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        }
    }
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub agent_info: PeerInfo,
}

/// Name and version of one side of the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `register` params. `handler: false` withdraws the registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    pub handler: bool,
}

/// `register` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub success: bool,
}

/// Access kind as reported by the agent.
///
/// The agent may report kinds this side does not understand; those are kept
/// as `Unknown` so the request can still be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
    #[serde(other)]
    Unknown,
}

/// `resolve` params: one intercepted file operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveParams {
    /// Agent-side identifier of the intercepted operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Process performing the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub path: String,
    pub access: AccessKind,
}

impl TryFrom<ResolveParams> for AccessRequest {
    type Error = Error;

    fn try_from(params: ResolveParams) -> Result<Self, Self::Error> {
        if params.path.is_empty() {
            return Err(Error::MalformedRequest("empty path".to_string()));
        }
        let access = match params.access {
            AccessKind::Read => AccessType::Read,
            AccessKind::Write => AccessType::Write,
            AccessKind::Unknown => {
                return Err(Error::MalformedRequest(format!(
                    "unrecognized access type for {}",
                    params.path
                )));
            }
        };
        Ok(AccessRequest::new(params.path, access))
    }
}

/// `resolve` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResult {
    pub decision: Decision,
}

/// `invalidated` notification params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidatedParams {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let req = JsonRpcRequest::new(1i64, methods::REGISTER)
            .with_params(RegisterParams { handler: true });
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"register\""));
        assert!(json.contains("\"handler\":true"));
    }

    #[test]
    fn classify_messages() {
        let request: RawMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":7,"method":"resolve","params":{"path":"/a","access":"read"}}"#,
        )
        .unwrap();
        assert!(matches!(
            request.classify(),
            Some(Incoming::Request(r)) if r.id == RequestId::Number(7)
        ));

        let notification: RawMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"invalidated","params":{"reason":"exit"}}"#,
        )
        .unwrap();
        assert!(matches!(notification.classify(), Some(Incoming::Notification(_))));

        let response: RawMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","result":{"success":true}}"#)
                .unwrap();
        assert!(matches!(response.classify(), Some(Incoming::Response(_))));

        let empty: RawMessage = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(empty.classify().is_none());
    }

    #[test]
    fn deserialize_resolve_params() {
        let json = r#"{
            "id": "6f1c2d9e-6a0b-4f3e-9d7a-2b1c0e5f4a3d",
            "pid": 412,
            "path": "/secret/data.txt",
            "access": "write"
        }"#;
        let params: ResolveParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.pid, Some(412));
        let request = AccessRequest::try_from(params).unwrap();
        assert_eq!(request, AccessRequest::write("/secret/data.txt"));
    }

    #[test]
    fn unknown_access_kind_is_malformed() {
        let params: ResolveParams =
            serde_json::from_str(r#"{"path":"/bin/ls","access":"execute"}"#).unwrap();
        assert_eq!(params.access, AccessKind::Unknown);
        assert!(matches!(
            AccessRequest::try_from(params),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn empty_path_is_malformed() {
        let params = ResolveParams {
            id: None,
            pid: None,
            path: String::new(),
            access: AccessKind::Read,
        };
        assert!(AccessRequest::try_from(params).is_err());
    }

    #[test]
    fn serialize_resolve_result() {
        let response = JsonRpcResponse::success(
            RequestId::Number(3),
            ResolveResult {
                decision: Decision::Deny,
            },
        );
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","id":3,"result":{"decision":"deny"}}"#);
    }
}
