//! The analyze endpoint: request orchestration.
//!
//! This handler is the only code aware of transport concerns. It derives
//! the client key, gates the request through the usage tracker, negotiates
//! the input shape (multipart image field or JSON base64 body), then runs
//! the pipeline: normalize, build prompt, infer, extract, enforce policy.
//! Every stage failure maps to a typed [`ApiError`]; nothing from a later
//! stage leaks past this boundary uncaught.
//!
//! The usage spend happens before input validation and is intentionally
//! not rolled back when a later stage fails, so a client cannot probe with
//! cheap failing payloads without consuming budget.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use verdia_core::imaging::{self, ImageAsset};
use verdia_core::usage::UsageDecision;
use verdia_core::{diagnosis, prompt};

use crate::error::ApiError;
use crate::state::AppState;

/// Multipart field that carries the image file.
const IMAGE_FIELD: &str = "image";

/// JSON fallback body: `{ "image": "<data-URI or bare base64>" }`.
#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    image: String,
}

/// `POST /analyze`
pub async fn analyze(
    State(state): State<AppState>,
    req: Request,
) -> Result<Response, ApiError> {
    let client = client_key(&req);

    // Throttling is a soft outcome: success status with a flag, so clients
    // need no special-case error handling.
    if let UsageDecision::Denied { message } = state.tracker.check(&client) {
        return Ok(Json(json!({ "rateLimited": true, "message": message })).into_response());
    }

    let asset = extract_image(&state, req).await?;

    // CPU-bound decode/resize work stays off the async workers.
    let imaging_config = state.config.imaging.clone();
    let normalized = tokio::task::spawn_blocking(move || imaging::normalize(&asset, &imaging_config))
        .await
        .map_err(|e| ApiError::Internal(format!("normalizer task failed: {e}")))??;

    let payload = prompt::build(&normalized);
    let raw = state.provider.infer(&payload).await?;

    let result = diagnosis::extract(&raw)?;
    let result = state.policy.enforce(result);

    info!(
        client = %client,
        provider = state.provider.name(),
        disease = %result.disease,
        severity = result.severity.label(),
        confidence = result.confidence,
        "diagnosis served"
    );

    Ok(Json(result).into_response())
}

/// Negotiates the input shape and returns the raw image payload.
///
/// Multipart bodies must carry an `image` file field; JSON bodies carry a
/// data-URI or bare base64 string. Anything else is a 415.
async fn extract_image(state: &AppState, req: Request) -> Result<ImageAsset, ApiError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|e| ApiError::InvalidInput(format!("malformed multipart body: {e}")))?;
        image_from_multipart(multipart).await
    } else if content_type.starts_with("application/json") {
        let limit = transport_body_limit(&state.config.imaging);
        // The bounded read only fails when the body outgrows the cap (or
        // the client went away, in which case the status is moot).
        let bytes = axum::body::to_bytes(req.into_body(), limit)
            .await
            .map_err(|e| ApiError::PayloadTooLarge(format!("request body over {limit} bytes: {e}")))?;
        image_from_json(&bytes)
    } else {
        Err(ApiError::UnsupportedMediaType)
    }
}

/// Pulls the `image` file field out of a multipart form.
async fn image_from_multipart(mut multipart: Multipart) -> Result<ImageAsset, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidInput(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let media_type = field.content_type().map(ToString::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidInput(format!("unreadable image field: {e}")))?;

        if bytes.is_empty() {
            return Err(ApiError::InvalidInput("image field is empty".into()));
        }

        return Ok(ImageAsset {
            bytes: bytes.to_vec(),
            media_type,
        });
    }

    Err(ApiError::InvalidInput(
        "no image file field in multipart form".into(),
    ))
}

/// Decodes the JSON fallback body: a data-URI or bare base64 string.
fn image_from_json(body: &[u8]) -> Result<ImageAsset, ApiError> {
    let request: AnalyzeRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidInput(format!("invalid JSON body: {e}")))?;

    let (payload, media_type) = split_data_uri(&request.image);
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| ApiError::InvalidInput(format!("invalid base64 image: {e}")))?;

    if bytes.is_empty() {
        return Err(ApiError::InvalidInput("image payload is empty".into()));
    }

    Ok(ImageAsset { bytes, media_type })
}

/// Splits a `data:image/...;base64,` prefix off, keeping the declared media
/// type. Bare base64 strings pass through untouched.
fn split_data_uri(value: &str) -> (&str, Option<String>) {
    let Some(rest) = value.strip_prefix("data:") else {
        return (value, None);
    };
    let Some(idx) = rest.find(";base64,") else {
        return (value, None);
    };
    let media_type = &rest[..idx];
    let payload = &rest[idx + ";base64,".len()..];
    (payload, Some(media_type.to_string()))
}

/// Transport-level body cap: the decoded ceiling plus base64 and JSON
/// overhead. The decoded ceiling itself is enforced by the normalizer.
pub fn transport_body_limit(imaging: &verdia_core::imaging::ImagingConfig) -> usize {
    imaging.max_input_bytes * 2
}

/// Buckets rate-limit state by request origin: the first `X-Forwarded-For`
/// hop when present (deployments behind a proxy), else the peer address.
fn client_key(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}
