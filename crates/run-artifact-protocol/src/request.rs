//! API request types.

use serde::{Deserialize, Serialize};

/// API request envelope.
///
/// The request layer authenticates the caller, then hands one of these to
/// the Access API dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Envelope version.
    #[serde(default = "default_api_version")]
    pub api_version: i32,
    /// Operation name.
    pub op: String,
    /// Caller-chosen request ID for correlation.
    #[serde(default)]
    pub request_id: String,
    /// Operation-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_api_version() -> i32 {
    crate::API_VERSION
}

impl ApiRequest {
    /// Create a request for the given operation.
    pub fn new(op: impl Into<String>, request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            api_version: crate::API_VERSION,
            op: op.into(),
            request_id: request_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_omitted() {
        let req: ApiRequest = serde_json::from_str(r#"{"op":"list"}"#).unwrap();
        assert_eq!(req.api_version, crate::API_VERSION);
        assert_eq!(req.op, "list");
        assert!(req.request_id.is_empty());
        assert!(req.payload.is_null());
    }
}
