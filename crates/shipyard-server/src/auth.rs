use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error};

use crate::store::TokenKind;
use crate::tokens::{AuthError, TokenAuthority};
use crate::AppState;

/// The program a request targets: the path segment after `programs`.
pub fn program_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    segments.find(|s| *s == "programs")?;
    segments.next()
}

fn bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    authorize(&state.tokens, TokenKind::Admin, request, next).await
}

pub async fn require_upload(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    authorize(&state.tokens, TokenKind::Upload, request, next).await
}

pub async fn require_download(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    authorize(&state.tokens, TokenKind::Download, request, next).await
}

/// Validate the bearer token and check it covers `required` for the program
/// in the path. The validated record is left in the request extensions.
async fn authorize(
    tokens: &TokenAuthority,
    required: TokenKind,
    mut request: Request,
    next: Next,
) -> Response {
    let result = match bearer(&request) {
        None => Err(AuthError::MissingToken),
        Some(secret) => tokens.validate(secret),
    };

    let record = match result {
        Ok(record) => record,
        Err(e) => return auth_error(e),
    };

    let program_id = program_from_path(request.uri().path()).unwrap_or_default();
    if !TokenAuthority::has_permission(&record, required, program_id) {
        debug!(
            program = %program_id,
            required = %required,
            kind = %record.kind,
            "token lacks permission"
        );
        return auth_error(AuthError::Forbidden);
    }

    request.extensions_mut().insert(record);
    next.run(request).await
}

fn auth_error(e: AuthError) -> Response {
    let status = match &e {
        AuthError::MissingToken | AuthError::InvalidToken | AuthError::TokenExpired => {
            StatusCode::UNAUTHORIZED
        }
        AuthError::Forbidden => StatusCode::FORBIDDEN,
        AuthError::Store(inner) => {
            error!(error = %inner, "token lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response();
        }
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
