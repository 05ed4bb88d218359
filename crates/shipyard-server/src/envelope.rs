//! Transparent envelope encryption at the HTTP boundary.
//!
//! A JSON request body of the form `{"encrypted": true, ...}` is opened with
//! the target program's derived key before the handler sees it. The response
//! to such a request is sealed the same way. Plaintext requests pass through
//! untouched and get plaintext responses.

use axum::{
    body::{to_bytes, Body, Bytes, HttpBody as _},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::program_from_path;
use crate::crypto::{CryptoEnvelope, EncryptedEnvelope};

/// Upper bound for buffered JSON bodies, in either direction.
const MAX_ENVELOPE_BODY: usize = 16 * 1024 * 1024;

fn is_json(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramQuery {
    program_id: Option<String>,
}

/// Program for envelope keying: path segment after `programs`, else `?programId=`.
fn envelope_program(request: &Request) -> Option<String> {
    if let Some(id) = program_from_path(request.uri().path()) {
        return Some(id.to_owned());
    }
    request
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<ProgramQuery>(q).ok())
        .and_then(|q| q.program_id)
        .filter(|v| !v.is_empty())
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// Parse `bytes` as an envelope if it claims to be one.
/// `Ok(None)` means an ordinary body.
fn as_envelope(bytes: &Bytes) -> Result<Option<EncryptedEnvelope>, ()> {
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return Ok(None);
    };
    if value.get("encrypted") != Some(&Value::Bool(true)) {
        return Ok(None);
    }
    serde_json::from_value(value).map(Some).map_err(|_| ())
}

pub async fn envelope_layer(
    State(crypto): State<CryptoEnvelope>,
    request: Request,
    next: Next,
) -> Response {
    if !is_json(&request) {
        return next.run(request).await;
    }

    let program_id = envelope_program(&request);
    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_ENVELOPE_BODY).await {
        Ok(b) => b,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "request body too large"})),
            )
                .into_response()
        }
    };

    let envelope = match as_envelope(&bytes) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return next.run(Request::from_parts(parts, Body::from(bytes))).await,
        Err(()) => return bad_request("malformed encrypted envelope"),
    };

    let Some(program_id) = program_id else {
        return bad_request("program id required for encrypted request");
    };

    let plaintext = match crypto.decrypt(&envelope, &program_id) {
        Ok(p) => p,
        Err(e) => {
            debug!(program = %program_id, error = %e, "rejected encrypted request");
            return bad_request("decryption failed");
        }
    };

    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(plaintext.len()));
    let response = next
        .run(Request::from_parts(parts, Body::from(plaintext)))
        .await;

    seal_response(&crypto, &program_id, response).await
}

/// Encrypt a response body for `program_id`. If sealing fails the plaintext
/// response goes out instead, and a warning is logged. Bodies of unknown or
/// oversized length are never buffered and pass through unchanged.
async fn seal_response(crypto: &CryptoEnvelope, program_id: &str, response: Response) -> Response {
    match response.body().size_hint().upper() {
        Some(len) if len <= MAX_ENVELOPE_BODY as u64 => {}
        len => {
            warn!(
                program = %program_id,
                len = ?len,
                "response too large to encrypt; sending plaintext"
            );
            return response;
        }
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_ENVELOPE_BODY).await {
        Ok(b) => b,
        Err(e) => {
            warn!(program = %program_id, error = %e, "could not buffer response for encryption");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "internal server error"})))
                .into_response();
        }
    };

    let sealed = crypto
        .encrypt(&bytes, program_id)
        .map_err(anyhow::Error::from)
        .and_then(|envelope| serde_json::to_vec(&envelope).map_err(anyhow::Error::from));

    match sealed {
        Ok(encoded) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Response::from_parts(parts, Body::from(encoded))
        }
        Err(e) => {
            warn!(
                program = %program_id,
                error = %e,
                "response encryption failed; sending plaintext"
            );
            Response::from_parts(parts, Body::from(bytes))
        }
    }
}
