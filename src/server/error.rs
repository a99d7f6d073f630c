//! API error handling.
//!
//! Failures on the JSON-RPC endpoint are reported as JSON-RPC error objects
//! with HTTP status 200, the way JSON-RPC over HTTP clients expect them.

use axum::{
    Json,
    response::{IntoResponse, Response},
};

use crate::error::CoqpoolError;
use crate::rpc::{JsonRpcError, JsonRpcResponse, RequestId};

/// A JSON-RPC error tied to the request it answers.
#[derive(Debug)]
pub struct ApiError {
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl ApiError {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self { id, error }
    }

    /// Construct an internal error (`-32603`) for request `id`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let err = ApiError::internal(Some(RequestId::from(1i64)), "task panicked");
    /// assert_eq!(err.error.code, crate::rpc::INTERNAL_ERROR);
    /// ```
    pub fn internal(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, JsonRpcError::internal_error(message))
    }
}

impl From<JsonRpcResponse> for ApiError {
    /// Recover the error from a response produced by [`crate::rpc::parse_request`].
    fn from(response: JsonRpcResponse) -> Self {
        let error = response
            .error
            .unwrap_or_else(|| JsonRpcError::internal_error("missing error object"));
        Self::new(response.id, error)
    }
}

impl From<CoqpoolError> for ApiError {
    fn from(err: CoqpoolError) -> Self {
        Self::new(None, JsonRpcError::internal_error(err.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        Json(JsonRpcResponse::error(self.id, self.error)).into_response()
    }
}
