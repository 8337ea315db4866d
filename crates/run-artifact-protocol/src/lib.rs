//! Run Artifact Protocol Types
//!
//! Defines the JSON envelope spoken between the request layer and the run
//! artifact Access API, and the stable error code registry.

pub mod error;
pub mod ops;
pub mod request;
pub mod response;

pub use error::{ApiError, ErrorCode};
pub use request::ApiRequest;
pub use response::ApiResponse;

/// Current envelope version.
pub const API_VERSION: i32 = 1;
