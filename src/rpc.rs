//! JSON-RPC 2.0 envelope types.
//!
//! Used on both hops: client to pool (`POST /` on the pool server) and pool
//! to worker (`POST /` on the worker's private address).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{CoqpoolError, Result};

/// JSON-RPC 2.0 version string
pub const JSONRPC_VERSION: &str = "2.0";

/// The one method both the pool and the workers serve.
pub const CHECK_PROOF: &str = "check_proof";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC request ID - can be string or number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JsonRpcRequest {
    /// Protocol version - must be "2.0"
    pub jsonrpc: String,
    /// Request ID. Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Deserialize `params` into a typed struct.
    pub fn parse_params<T: DeserializeOwned>(&self) -> std::result::Result<T, JsonRpcError> {
        let params = self.params.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail.into()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, format!("Invalid request: {}", detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail.into()))
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, format!("Internal error: {}", detail.into()))
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Request ID (must match request). `null` when the request could not be read.
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Unwrap the result into `T`, turning an error object into
    /// [`CoqpoolError::Rpc`].
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(error) = self.error {
            return Err(CoqpoolError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let result = self.result.ok_or_else(|| CoqpoolError::Rpc {
            code: INTERNAL_ERROR,
            message: "response has neither result nor error".to_string(),
        })?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Parse a raw request body, producing the error response to send back if it
/// is not a well-formed JSON-RPC 2.0 request.
pub fn parse_request(body: &[u8]) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| JsonRpcResponse::error(None, JsonRpcError::parse_error(e.to_string())))?;

    // Salvage the id, if any, so the error can be correlated.
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    let request: JsonRpcRequest = serde_json::from_value(value).map_err(|e| {
        JsonRpcResponse::error(id.clone(), JsonRpcError::invalid_request(e.to_string()))
    })?;

    if request.jsonrpc != JSONRPC_VERSION {
        return Err(JsonRpcResponse::error(
            id,
            JsonRpcError::invalid_request(format!("unsupported jsonrpc version {:?}", request.jsonrpc)),
        ));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(1i64, CHECK_PROOF).with_params(json!({"proof": "auto."}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 1, "method": "check_proof", "params": {"proof": "auto."}})
        );
    }

    #[test]
    fn test_error_response_has_null_id() {
        let response = JsonRpcResponse::error(None, JsonRpcError::parse_error("eof"));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], serde_json::Value::Null);
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_parse_request_string_id() {
        let request =
            parse_request(br#"{"jsonrpc":"2.0","id":"abc","method":"check_proof"}"#).unwrap();
        assert_eq!(request.id, Some(RequestId::from("abc")));
        assert_eq!(request.method, CHECK_PROOF);
        assert!(request.params.is_none());
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        let response = parse_request(b"not json").unwrap_err();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
        assert!(response.id.is_none());
    }

    #[test]
    fn test_parse_request_keeps_id_on_invalid_request() {
        let response = parse_request(br#"{"jsonrpc":"2.0","id":7}"#).unwrap_err();
        assert_eq!(response.id, Some(RequestId::Number(7)));
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[test]
    fn test_parse_request_rejects_wrong_version() {
        let response =
            parse_request(br#"{"jsonrpc":"1.0","id":7,"method":"check_proof"}"#).unwrap_err();
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[test]
    fn test_parse_params() {
        #[derive(Debug, Deserialize)]
        struct Params {
            proof: String,
        }

        let request = JsonRpcRequest::new(1i64, CHECK_PROOF).with_params(json!({"proof": "auto."}));
        let params: Params = request.parse_params().unwrap();
        assert_eq!(params.proof, "auto.");

        let request = JsonRpcRequest::new(1i64, CHECK_PROOF);
        let err = request.parse_params::<Params>().unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn test_into_result() {
        let response = JsonRpcResponse::success(Some(1i64.into()), json!({"value": 3}));
        let value: serde_json::Value = response.into_result().unwrap();
        assert_eq!(value["value"], 3);

        let response = JsonRpcResponse::error(Some(1i64.into()), JsonRpcError::method_not_found("nope"));
        let err = response.into_result::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, CoqpoolError::Rpc { code: METHOD_NOT_FOUND, .. }));
    }
}
