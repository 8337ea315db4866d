//! Request dispatcher.
//!
//! Routes an [`ApiRequest`] to the matching [`AccessApi`] operation and wraps
//! the outcome in an [`ApiResponse`] with an HTTP-equivalent status.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use run_artifact_protocol::{ops, ApiError, ApiRequest, ApiResponse, API_VERSION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Access, AccessApi};
use crate::schema::{ExplanationStatus, RunArtifactBuilder};
use crate::signing::Scope;
use crate::store::{AdvisoryRequest, ListFilter};

#[derive(Debug, Deserialize)]
struct RunIdPayload {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct AttachAdvisoryPayload {
    run_id: String,
    #[serde(flatten)]
    advisory: AdvisoryRequest,
}

#[derive(Debug, Deserialize)]
struct SetExplanationPayload {
    run_id: String,
    status: ExplanationStatus,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutAttachmentPayload {
    data_base64: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    ext: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    sha256: String,
    /// Query string of a signed link; absent for trusted callers.
    #[serde(default)]
    signed_query: Option<String>,
    #[serde(default)]
    method: Option<String>,
}

impl AttachmentPayload {
    fn access(&self, default_method: &str) -> Access {
        match &self.signed_query {
            Some(query) => Access::Signed {
                method: self.method.clone().unwrap_or_else(|| default_method.to_string()),
                query: query.clone(),
            },
            None => Access::Trusted,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignUrlPayload {
    sha256: String,
    #[serde(default = "default_scope")]
    scope: Scope,
    #[serde(default)]
    download: bool,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

fn default_scope() -> Scope {
    Scope::Download
}

#[derive(Debug, Deserialize)]
struct DiffPayload {
    a: String,
    b: String,
}

enum Outcome {
    Ok(Value),
    Created(Value),
}

/// Dispatch a request to the matching operation.
pub fn dispatch(api: &AccessApi, request: ApiRequest) -> ApiResponse {
    let request_id = request.request_id.clone();
    if request.api_version != API_VERSION {
        return ApiResponse::error(
            request_id,
            ApiError::invalid_request(format!(
                "unsupported api_version {} (expected {})",
                request.api_version, API_VERSION
            )),
        );
    }

    match handle(api, &request.op, request.payload) {
        Ok(Outcome::Ok(payload)) => ApiResponse::success(request_id, payload),
        Ok(Outcome::Created(payload)) => ApiResponse::created(request_id, payload),
        Err(error) => ApiResponse::error(request_id, error),
    }
}

fn handle(api: &AccessApi, op: &str, payload: Value) -> Result<Outcome, ApiError> {
    match op {
        ops::CREATE => {
            let input: RunArtifactBuilder = parse(payload)?;
            let artifact = api.create_artifact(input)?;
            Ok(Outcome::Created(to_json(&artifact)?))
        }
        ops::GET => {
            let p: RunIdPayload = parse(payload)?;
            Ok(Outcome::Ok(to_json(&api.get_artifact(&p.run_id)?)?))
        }
        ops::LIST => {
            let filter: ListFilter = parse(payload)?;
            let result = api.list_artifacts(&filter)?;
            // Paths stay server-side; callers see which run ids were skipped.
            let skipped: Vec<Value> = result
                .skipped
                .iter()
                .map(|s| {
                    json!({
                        "file": s.path.file_name().map(|n| n.to_string_lossy().to_string()),
                        "reason": s.reason,
                    })
                })
                .collect();
            Ok(Outcome::Ok(json!({
                "artifacts": to_json(&result.artifacts)?,
                "count": result.artifacts.len(),
                "skipped_count": result.skipped.len(),
                "partial": result.is_partial(),
                "skipped": skipped,
            })))
        }
        ops::ATTACH_ADVISORY => {
            let p: AttachAdvisoryPayload = parse(payload)?;
            Ok(Outcome::Ok(to_json(&api.attach_advisory(&p.run_id, &p.advisory)?)?))
        }
        ops::SET_EXPLANATION => {
            let p: SetExplanationPayload = parse(payload)?;
            Ok(Outcome::Ok(to_json(&api.set_explanation(&p.run_id, p.status, p.summary)?)?))
        }
        ops::PUT_ATTACHMENT => {
            let p: PutAttachmentPayload = parse(payload)?;
            let data = BASE64
                .decode(p.data_base64.as_bytes())
                .map_err(|e| ApiError::invalid_request(format!("data_base64: {}", e)))?;
            let blob = api.put_attachment(&data, &p.kind, p.filename.as_deref(), &p.ext)?;
            Ok(Outcome::Created(to_json(&blob)?))
        }
        ops::FETCH_ATTACHMENT => {
            let p: AttachmentPayload = parse(payload)?;
            let fetched = api.fetch_attachment(&p.sha256, &p.access("GET"))?;
            Ok(Outcome::Ok(json!({
                "blob": to_json(&fetched.blob)?,
                "download": fetched.download,
                "data_base64": BASE64.encode(&fetched.data),
            })))
        }
        ops::HEAD_ATTACHMENT => {
            let p: AttachmentPayload = parse(payload)?;
            Ok(Outcome::Ok(to_json(&api.head_attachment(&p.sha256, &p.access("HEAD"))?)?))
        }
        ops::VERIFY_ATTACHMENT => {
            let p: AttachmentPayload = parse(payload)?;
            Ok(Outcome::Ok(to_json(&api.verify_attachment(&p.sha256)?)?))
        }
        ops::SIGN_URL => {
            let p: SignUrlPayload = parse(payload)?;
            let url = api.sign_attachment_url(
                &p.sha256,
                p.scope,
                p.download,
                p.filename.as_deref(),
                p.ttl_secs,
            )?;
            Ok(Outcome::Ok(to_json(&url)?))
        }
        ops::DIFF => {
            let p: DiffPayload = parse(payload)?;
            Ok(Outcome::Ok(to_json(&api.diff_artifacts(&p.a, &p.b)?)?))
        }
        other => Err(ApiError::unknown_operation(other)),
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, ApiError> {
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload).map_err(|e| ApiError::invalid_request(format!("invalid payload: {}", e)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::from(crate::error::StoreError::from(e)))
}
