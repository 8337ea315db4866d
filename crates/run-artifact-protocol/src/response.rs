//! Response envelope returned by every Access API operation.

use serde::{Deserialize, Serialize};
use crate::error::ApiError;

/// Exactly one of `payload` and `error` is set, matching `ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub api_version: i32,
    /// Copied from the originating request.
    pub request_id: String,
    pub ok: bool,
    /// HTTP-equivalent status (201 create, 200 ok, 404, 409, ...).
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    /// 200 with a body.
    pub fn success(request_id: String, payload: serde_json::Value) -> Self {
        Self::success_with_status(request_id, 200, payload)
    }

    /// 201, used when a run or attachment was newly stored.
    pub fn created(request_id: String, payload: serde_json::Value) -> Self {
        Self::success_with_status(request_id, 201, payload)
    }

    fn success_with_status(request_id: String, status: u16, payload: serde_json::Value) -> Self {
        Self {
            api_version: crate::API_VERSION,
            request_id,
            ok: true,
            status,
            payload: Some(payload),
            error: None,
        }
    }

    /// Failure envelope; the status comes from the error code.
    pub fn error(request_id: String, error: ApiError) -> Self {
        Self {
            api_version: crate::API_VERSION,
            request_id,
            ok: false,
            status: error.http_status(),
            payload: None,
            error: Some(error),
        }
    }
}
