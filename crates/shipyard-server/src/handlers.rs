use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    storage::{valid_segment, StorageError},
    store::{Program, PackageKey, Store, TokenKind, TokenRecord, VersionRecord},
    tokens::TokenAuthority,
    AppState,
};

const DEFAULT_CHANNEL: &str = "stable";

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn not_found(message: &str) -> Response {
    error(StatusCode::NOT_FOUND, message)
}

/// Reject path segments that could escape the package tree.
fn check_segments(segments: &[&str]) -> Option<Response> {
    if segments.iter().all(|s| valid_segment(s)) {
        None
    } else {
        Some(error(StatusCode::BAD_REQUEST, "invalid path segment"))
    }
}

fn generate_package_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    B64.encode(bytes)
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Programs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProgramRequest {
    pub program_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
}

pub async fn create_program(
    State(state): State<AppState>,
    Extension(caller): Extension<TokenRecord>,
    Json(body): Json<CreateProgramRequest>,
) -> Response {
    if let Some(resp) = check_segments(&[&body.program_id]) {
        return resp;
    }

    let now = Store::now();
    let program = Program {
        program_id: body.program_id.clone(),
        name: body.name.unwrap_or_else(|| body.program_id.clone()),
        description: body.description,
        active: true,
        created_at: now,
    };
    let key = PackageKey {
        key: generate_package_key(),
        created_at: now,
        updated_at: now,
    };
    let created_by = caller.token_id.as_str();
    let minted = TokenAuthority::mint(&program.program_id, TokenKind::Upload, created_by, None)
        .and_then(|upload| {
            TokenAuthority::mint(&program.program_id, TokenKind::Download, created_by, None)
                .map(|download| (upload, download))
        });
    let (upload, download) = match minted {
        Ok(pair) => pair,
        Err(e) => return internal_error(e),
    };

    match state.store.create_program(
        &program,
        &key,
        &[upload.record.clone(), download.record.clone()],
    ) {
        Ok(true) => {
            info!(program = %program.program_id, "program onboarded");
            (
                StatusCode::CREATED,
                Json(json!({
                    "program": program,
                    "uploadToken": upload.secret,
                    "downloadToken": download.secret,
                    "encryptionKey": key.key,
                })),
            )
                .into_response()
        }
        Ok(false) => error(StatusCode::CONFLICT, "program already exists"),
        Err(e) => internal_error(e),
    }
}

pub async fn list_programs(State(state): State<AppState>) -> Response {
    match state.store.list_programs() {
        Ok(programs) => Json(json!({"programs": programs})).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Program record, its package key and the metadata of its active tokens.
/// Token secrets are never stored, so they cannot be shown again.
pub async fn get_program(State(state): State<AppState>, Path(program_id): Path<String>) -> Response {
    let program = match state.store.get_program(&program_id) {
        Ok(Some(p)) => p,
        Ok(None) => return not_found("program not found"),
        Err(e) => return internal_error(e),
    };
    let key = match state.store.get_package_key(&program_id) {
        Ok(k) => k,
        Err(e) => return internal_error(e),
    };
    let tokens = match state.tokens.list(Some(&program_id)) {
        Ok(t) => t.into_iter().filter(|r| r.active).collect::<Vec<_>>(),
        Err(e) => return internal_error(e),
    };

    Json(json!({
        "program": program,
        "encryptionKey": key.as_ref().map(|k| k.key.as_str()),
        "tokens": tokens,
    }))
    .into_response()
}

/// Soft delete: the program is marked inactive and its tokens revoked.
/// Published versions stay readable.
pub async fn delete_program(State(state): State<AppState>, Path(program_id): Path<String>) -> Response {
    match state.store.soft_delete_program(&program_id) {
        Ok(Some(revoked)) => {
            warn!(program = %program_id, revoked = revoked.len(), "program deleted");
            Json(json!({"deleted": true, "revokedTokens": revoked})).into_response()
        }
        Ok(None) => not_found("program not found"),
        Err(e) => internal_error(e),
    }
}

/// 404 unless `program_id` names an active program.
fn require_active_program(store: &Store, program_id: &str) -> Option<Response> {
    match store.get_program(program_id) {
        Ok(Some(p)) if p.active => None,
        Ok(_) => Some(not_found("program not found")),
        Err(e) => Some(internal_error(e)),
    }
}

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegenerateParams {
    #[serde(rename = "type")]
    pub kind: String,
}

pub async fn regenerate_token(
    State(state): State<AppState>,
    Extension(caller): Extension<TokenRecord>,
    Path(program_id): Path<String>,
    Query(params): Query<RegenerateParams>,
) -> Response {
    let kind = match TokenKind::parse(&params.kind) {
        Some(k @ (TokenKind::Upload | TokenKind::Download)) => k,
        _ => return error(StatusCode::BAD_REQUEST, "type must be upload or download"),
    };
    if let Some(resp) = require_active_program(&state.store, &program_id) {
        return resp;
    }

    match state.tokens.regenerate(&program_id, kind, &caller.token_id) {
        Ok(issued) => Json(json!({
            "tokenId": issued.record.token_id,
            "token": issued.secret,
            "type": kind,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn list_tokens(State(state): State<AppState>, Path(program_id): Path<String>) -> Response {
    match state.tokens.list(Some(&program_id)) {
        Ok(tokens) => Json(json!({"tokens": tokens})).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn revoke_token(State(state): State<AppState>, Path(token_id): Path<String>) -> Response {
    match state.tokens.revoke(&token_id) {
        Ok(true) => Json(json!({"revoked": true})).into_response(),
        Ok(false) => not_found("token not found"),
        Err(e) => internal_error(e),
    }
}

// ── Package encryption key ───────────────────────────────────────────────────

pub async fn regenerate_encryption_key(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
) -> Response {
    if let Some(resp) = require_active_program(&state.store, &program_id) {
        return resp;
    }
    match state
        .store
        .replace_package_key(&program_id, generate_package_key())
    {
        Ok(stored) => {
            warn!(program = %program_id, "package encryption key rotated");
            Json(json!({"encryptionKey": stored.key.clone()})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Version catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    pub channel: Option<String>,
}

pub async fn latest_version(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
    Query(params): Query<ChannelParams>,
) -> Response {
    let channel = params.channel.as_deref().unwrap_or(DEFAULT_CHANNEL);
    match state.store.latest_version(&program_id, channel) {
        Ok(Some(v)) => Json(v).into_response(),
        Ok(None) => not_found("no version found"),
        Err(e) => internal_error(e),
    }
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
    Query(params): Query<ChannelParams>,
) -> Response {
    match state
        .store
        .list_versions(&program_id, params.channel.as_deref())
    {
        Ok(versions) => Json(json!({"versions": versions})).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_version(
    State(state): State<AppState>,
    Path((program_id, channel, version)): Path<(String, String, String)>,
) -> Response {
    match state.store.get_version(&program_id, &channel, &version) {
        Ok(Some(v)) => Json(v).into_response(),
        Ok(None) => not_found("version not found"),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PublishParams {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub mandatory: bool,
}

pub async fn publish_version(
    State(state): State<AppState>,
    Path((program_id, channel, version)): Path<(String, String, String)>,
    Query(params): Query<PublishParams>,
    body: Body,
) -> Response {
    if let Some(resp) = check_segments(&[&program_id, &channel, &version]) {
        return resp;
    }
    if let Some(resp) = require_active_program(&state.store, &program_id) {
        return resp;
    }
    match state.store.reserve_version(&program_id, &channel, &version) {
        Ok(true) => {}
        Ok(false) => return error(StatusCode::CONFLICT, "version already exists"),
        Err(e) => return internal_error(e),
    }

    let saved = state
        .packages
        .save(&program_id, &channel, &version, body, state.max_upload_bytes)
        .await;
    let stored = match saved {
        Ok(s) => s,
        Err(e) => {
            if let Err(release) = state.store.release_version(&program_id, &channel, &version) {
                warn!(program = %program_id, version = %version, error = %release, "upload claim not released");
            }
            return match e {
                StorageError::TooLarge { limit } => error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &format!("package exceeds {limit} bytes"),
                ),
                StorageError::Body(e) => {
                    warn!(program = %program_id, error = %e, "upload aborted");
                    error(StatusCode::BAD_REQUEST, "upload interrupted")
                }
                StorageError::Io(e) => internal_error(e.into()),
            };
        }
    };

    let record = VersionRecord {
        program_id: program_id.clone(),
        version: version.clone(),
        channel: channel.clone(),
        file_name: stored.file_name,
        file_size: stored.size,
        file_hash: stored.hash,
        release_notes: params.notes,
        publish_date: chrono::Utc::now(),
        mandatory: params.mandatory,
        download_count: 0,
    };

    match state.store.insert_version(&record) {
        Ok(true) => {
            info!(
                program = %program_id,
                channel = %channel,
                version = %version,
                size = record.file_size,
                "published version"
            );
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Ok(false) => error(StatusCode::CONFLICT, "version already exists"),
        Err(e) => {
            let _ = state.packages.delete(&program_id, &channel, &version).await;
            let _ = state.store.release_version(&program_id, &channel, &version);
            internal_error(e)
        }
    }
}

pub async fn delete_version(
    State(state): State<AppState>,
    Path((program_id, channel, version)): Path<(String, String, String)>,
) -> Response {
    if let Some(resp) = check_segments(&[&program_id, &channel, &version]) {
        return resp;
    }
    match state.store.delete_version(&program_id, &channel, &version) {
        Ok(Some(_)) => {
            if let Err(e) = state.packages.delete(&program_id, &channel, &version).await {
                warn!(program = %program_id, version = %version, error = %e, "package file not removed");
            }
            info!(program = %program_id, channel = %channel, version = %version, "deleted version");
            Json(json!({"deleted": true})).into_response()
        }
        Ok(None) => not_found("version not found"),
        Err(e) => internal_error(e),
    }
}

// ── Download ─────────────────────────────────────────────────────────────────

pub async fn download(
    State(state): State<AppState>,
    Path((program_id, channel, version)): Path<(String, String, String)>,
) -> Response {
    if let Some(resp) = check_segments(&[&program_id, &channel, &version]) {
        return resp;
    }
    let record = match state.store.get_version(&program_id, &channel, &version) {
        Ok(Some(r)) => r,
        Ok(None) => return not_found("version not found"),
        Err(e) => return internal_error(e),
    };

    let path = state.packages.path(&program_id, &channel, &version);
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "catalog entry without package file");
            return not_found("package file missing");
        }
        Err(e) => return internal_error(e.into()),
    };
    let size = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => return internal_error(e.into()),
    };

    let store = state.store.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.increment_download_count(&program_id, &channel, &version) {
            warn!(error = %e, "failed to count download");
        }
    });

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", record.file_name),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
