//! Transport error mapping for the analyze endpoint.
//!
//! Every pipeline stage fails fast with a typed error; this module is the
//! single translation point from internal error kinds to HTTP status codes
//! and user-facing messages. Client messages are generic by contract — the
//! full detail is logged server-side and never exposed verbatim.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use verdia_core::diagnosis::ExtractError;
use verdia_core::imaging::DecodeError;
use verdia_core::inference::InferenceError;

/// Request-level failures, each mapping to one transport status.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The provider credential is not configured.
    #[error("inference credential is not configured")]
    MissingCredential,

    /// The image payload is missing, malformed, or undecodable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The payload exceeds the input ceiling (decoded) or the transport
    /// body cap (encoded).
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The request body is neither multipart form data nor JSON.
    #[error("unsupported content type")]
    UnsupportedMediaType,

    /// The external inference call failed or timed out.
    #[error("inference call failed: {0}")]
    Downstream(InferenceError),

    /// Model output held no valid structured diagnosis.
    #[error("model output invalid: {0}")]
    Extraction(ExtractError),

    /// Anything else. Should not occur in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    ///
    /// - Missing credential / internal fault: 500
    /// - Bad or missing image payload: 400
    /// - Oversized payload: 413
    /// - Unsupported content type: 415
    /// - Failed call or unusable model output: 502
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Downstream(_) | Self::Extraction(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Generic user-facing message. Never carries internal detail.
    #[must_use]
    pub const fn client_message(&self) -> &'static str {
        match self {
            Self::MissingCredential | Self::Internal(_) => "Error interno al analizar la imagen",
            Self::InvalidInput(_) => "No se recibió una imagen válida",
            Self::PayloadTooLarge(_) => "La imagen supera el tamaño máximo permitido",
            Self::UnsupportedMediaType => {
                "Content-Type no soportado. Use multipart/form-data o application/json"
            },
            Self::Downstream(_) | Self::Extraction(_) => {
                "El análisis no produjo un resultado válido. Intenta de nuevo."
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Full detail stays server-side; the client sees status + generic
        // message only.
        tracing::error!(error = %self, status = %self.status_code(), "analyze request failed");
        let body = json!({ "error": self.client_message() });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<DecodeError> for ApiError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Oversized { .. } => Self::PayloadTooLarge(e.to_string()),
            DecodeError::Undecodable(_) => Self::InvalidInput(e.to_string()),
            DecodeError::Encode(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::MissingCredential => Self::MissingCredential,
            _ => Self::Downstream(e),
        }
    }
}

impl From<ExtractError> for ApiError {
    fn from(e: ExtractError) -> Self {
        Self::Extraction(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::MissingCredential.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::PayloadTooLarge("2 bytes over a 1 byte limit".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::UnsupportedMediaType.status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ApiError::Downstream(InferenceError::Timeout).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Extraction(ExtractError::Format("x".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_decode_errors_map_to_input_statuses() {
        let oversized: ApiError = DecodeError::Oversized {
            actual: 2_000_000,
            limit: 1_572_864,
        }
        .into();
        assert_eq!(oversized.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let undecodable: ApiError = DecodeError::Undecodable("bad".into()).into();
        assert_eq!(undecodable.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_credential_maps_to_configuration_fault() {
        let err: ApiError = InferenceError::MissingCredential.into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_client_messages_do_not_leak_details() {
        let err = ApiError::Internal("secret database error".into());
        assert!(!err.client_message().contains("secret"));

        let err = ApiError::Extraction(ExtractError::Schema {
            field: "confidence",
            reason: "raw model text here".into(),
        });
        assert!(!err.client_message().contains("confidence"));
    }
}
