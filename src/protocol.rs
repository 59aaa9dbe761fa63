//! JSON-RPC 2.0 envelopes for the MCP stdio protocol.
//!
//! Every message on the wire is one JSON object on one line. Requests carry a
//! numeric `id` allocated by the client; notifications carry none and are
//! never answered.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ipc::IpcError;

/// JSON-RPC protocol marker.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP method names used by the client.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// =============================================================================
// Outbound
// =============================================================================

/// A request or notification sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Envelope {
    /// Build a request that expects exactly one reply.
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            id: Some(id),
            params: params.filter(has_content),
        }
    }

    /// Build a fire-and-forget notification.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            id: None,
            params: params.filter(has_content),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Serialize to a single wire line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, IpcError> {
        serde_json::to_string(self)
            .map_err(|e| IpcError::Protocol(format!("Failed to serialize {}: {}", self.method, e)))
    }
}

/// `params` is only put on the wire when it carries something.
fn has_content(params: &Value) -> bool {
    match params {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// A decoded line from the peer.
///
/// Fields are all optional so that server-initiated messages and sloppy
/// replies still decode; correlation decides what to do with them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    /// Present only on server-initiated requests and notifications.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// How an inbound message relates to the request currently awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The reply we are waiting for.
    Reply,
    /// A late reply to an earlier request that already timed out.
    Stale(u64),
    /// A reply carrying an id that has not been issued yet.
    Unexpected(u64),
    /// A message the server initiated on its own.
    ServerInitiated,
}

impl Response {
    /// Numeric id, if the peer sent one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Classify this message against the id of the outstanding request.
    ///
    /// Ids lower than `awaited` can only belong to calls that were abandoned
    /// after a timeout; higher ids were never issued. Messages without a
    /// usable id fall back to arrival order, which is sound while only one
    /// call is in flight.
    pub fn correlate(&self, awaited: u64) -> Correlation {
        if self.method.is_some() {
            return Correlation::ServerInitiated;
        }
        match self.numeric_id() {
            Some(id) if id < awaited => Correlation::Stale(id),
            Some(id) if id > awaited => Correlation::Unexpected(id),
            _ => Correlation::Reply,
        }
    }

    /// Extract `result`, turning an `error` object into `IpcError::ServerError`.
    ///
    /// A reply with neither is treated as an empty result.
    pub fn into_result(self) -> Result<Value, IpcError> {
        if let Some(err) = self.error {
            return Err(IpcError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Envelope::request(7, methods::TOOLS_CALL, Some(json!({"name": "x"})));
        let value: Value = serde_json::from_str(&req.to_line().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 7, "params": {"name": "x"}})
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = Envelope::notification(methods::INITIALIZED, None);
        let line = note.to_line().unwrap();
        assert!(note.is_notification());
        assert!(!line.contains("\"id\""));
        assert!(!line.contains("params"));
    }

    #[test]
    fn test_empty_params_omitted() {
        let req = Envelope::request(1, methods::TOOLS_LIST, Some(json!({})));
        assert!(req.params.is_none());
        let req = Envelope::request(1, methods::TOOLS_LIST, Some(Value::Null));
        assert!(req.params.is_none());
        let req = Envelope::request(1, "x", Some(json!([1])));
        assert_eq!(req.params, Some(json!([1])));
    }

    #[test]
    fn test_line_has_no_newlines() {
        let req = Envelope::request(3, "x", Some(json!({"text": "a\nb"})));
        assert!(!req.to_line().unwrap().contains('\n'));
    }

    #[test]
    fn test_correlate_reply_and_stale() {
        let resp: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":5,"result":{}}"#).unwrap();
        assert_eq!(resp.correlate(5), Correlation::Reply);
        assert_eq!(resp.correlate(6), Correlation::Stale(5));
    }

    #[test]
    fn test_correlate_future_id_is_not_a_reply() {
        let resp: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":6,"result":{}}"#).unwrap();
        assert_eq!(resp.correlate(5), Correlation::Unexpected(6));
        assert_eq!(resp.correlate(6), Correlation::Reply);
    }

    #[test]
    fn test_correlate_server_initiated() {
        let resp: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#)
                .unwrap();
        assert_eq!(resp.correlate(1), Correlation::ServerInitiated);
    }

    #[test]
    fn test_correlate_without_numeric_id_uses_arrival_order() {
        let resp: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        assert_eq!(resp.correlate(9), Correlation::Reply);

        let resp: Response = serde_json::from_str(r#"{"id":"abc","result":1}"#).unwrap();
        assert_eq!(resp.correlate(9), Correlation::Reply);
    }

    #[test]
    fn test_into_result_error() {
        let resp: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match resp.into_result() {
            Err(IpcError::ServerError { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("Expected ServerError, got: {:?}", other),
        }
    }

    #[test]
    fn test_into_result_missing_both_is_null() {
        let resp: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":2}"#).unwrap();
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }
}
