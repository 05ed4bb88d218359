use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{require_admin, require_download, require_upload},
    envelope::envelope_layer,
    handlers,
    storage::PackageStorage,
    store::Store,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub max_upload_mb: u64,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("SHIPYARD_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("SHIPYARD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("SHIPYARD_DATA_DIR").ok().map(PathBuf::from),
            max_upload_mb: std::env::var("SHIPYARD_MAX_UPLOAD_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512),
            cors_origins: std::env::var("SHIPYARD_CORS_ORIGINS").ok(),
        }
    }
}

/// Read a master secret from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the envelope master secret from `SHIPYARD_MASTER_KEY_FILE`
/// (preferred) or `SHIPYARD_MASTER_KEY`.
pub fn resolve_master_key() -> Result<String> {
    if let Ok(path) = std::env::var("SHIPYARD_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("SHIPYARD_MASTER_KEY").is_ok() {
            warn!("both SHIPYARD_MASTER_KEY and SHIPYARD_MASTER_KEY_FILE are set; using file");
        }
        return Ok(key);
    }
    let key = std::env::var("SHIPYARD_MASTER_KEY").context(
        "SHIPYARD_MASTER_KEY or SHIPYARD_MASTER_KEY_FILE environment variable is required",
    )?;
    if key.trim().is_empty() {
        anyhow::bail!("SHIPYARD_MASTER_KEY is empty");
    }
    Ok(key)
}

/// Resolve the data directory: explicit path, then `SHIPYARD_DATA_DIR`,
/// then the platform default. The directory is created if missing.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir
        .cloned()
        .or_else(|| std::env::var("SHIPYARD_DATA_DIR").ok().map(PathBuf::from))
    {
        Some(d) => d,
        None => ProjectDirs::from("", "", "shipyard")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir: {}", dir.display()))?;
    Ok(dir)
}

/// Open the store inside `data_dir`.
pub fn open_store(data_dir: &Path) -> Result<Store> {
    Store::open(&data_dir.join("shipyard.db")).context("open store")
}

/// Assemble the full API router over `state`.
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new()
        .route("/api/health", get(handlers::health))
        .route(
            "/api/programs/{programId}/versions/latest",
            get(handlers::latest_version),
        )
        .route(
            "/api/programs/{programId}/versions",
            get(handlers::list_versions),
        )
        .route(
            "/api/programs/{programId}/versions/{channel}/{version}",
            get(handlers::get_version),
        );

    let admin = Router::new()
        .route(
            "/api/programs",
            post(handlers::create_program).get(handlers::list_programs),
        )
        .route(
            "/api/programs/{programId}",
            get(handlers::get_program).delete(handlers::delete_program),
        )
        .route(
            "/api/programs/{programId}/tokens",
            get(handlers::list_tokens),
        )
        .route(
            "/api/programs/{programId}/tokens/regenerate",
            post(handlers::regenerate_token),
        )
        .route("/api/tokens/{tokenId}", delete(handlers::revoke_token))
        .route(
            "/api/programs/{programId}/encryption/regenerate",
            post(handlers::regenerate_encryption_key),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let upload = Router::new()
        .route(
            "/api/programs/{programId}/versions/{channel}/{version}",
            put(handlers::publish_version).delete(handlers::delete_version),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_upload));

    let download = Router::new()
        .route(
            "/api/programs/{programId}/download/{channel}/{version}",
            get(handlers::download),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_download,
        ));

    let crypto = state.crypto.clone();
    Router::new()
        .merge(public)
        .merge(admin)
        .merge(upload)
        .merge(download)
        .with_state(state)
        .layer(middleware::from_fn_with_state(crypto, envelope_layer))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let master_secret = resolve_master_key()?;
    let store = open_store(&data_dir)?;
    let packages = PackageStorage::new(data_dir.join("packages"));

    let state = AppState::new(
        store,
        &master_secret,
        packages,
        cfg.max_upload_mb * 1024 * 1024,
    );
    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "shipyard server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::HEAD,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::store::{TokenKind, ANY_PROGRAM};

    struct Harness {
        app: Router,
        state: AppState,
        admin: String,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).unwrap();
        let state = AppState::new(
            store,
            "test-master",
            PackageStorage::new(dir.path().join("packages")),
            1024 * 1024,
        );
        let admin = state
            .tokens
            .issue(ANY_PROGRAM, TokenKind::Admin, "bootstrap")
            .unwrap()
            .secret;
        Harness {
            app: build_router(state.clone(), None),
            state,
            admin,
            _dir: dir,
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(body).unwrap()
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut req = request(method, uri, token, Body::from(body.to_string()));
        req.headers_mut().insert(
            header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );
        req
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    /// Onboard `app1`; returns (upload, download, encryption key).
    async fn onboard(h: &Harness) -> (String, String, String) {
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/programs",
                Some(&h.admin),
                json!({"programId": "app1", "name": "App One"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        (
            body["uploadToken"].as_str().unwrap().to_owned(),
            body["downloadToken"].as_str().unwrap().to_owned(),
            body["encryptionKey"].as_str().unwrap().to_owned(),
        )
    }

    async fn publish(h: &Harness, token: &str, version: &str, payload: &[u8]) -> Response {
        h.app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/api/programs/app1/versions/stable/{version}?notes=fixes&mandatory=true"),
                Some(token),
                Body::from(payload.to_vec()),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness();
        let resp = h
            .app
            .clone()
            .oneshot(request("GET", "/api/health", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn onboarding_requires_admin() {
        let h = harness();
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/programs",
                None,
                json!({"programId": "app1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let (upload, _, key) = onboard(&h).await;
        assert!(!key.is_empty());
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/programs",
                Some(&upload),
                json!({"programId": "app2"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn duplicate_program_conflicts() {
        let h = harness();
        onboard(&h).await;
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/programs",
                Some(&h.admin),
                json!({"programId": "app1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn publish_latest_download() {
        let h = harness();
        let (upload, download, _) = onboard(&h).await;
        let payload = b"package bytes";

        let resp = publish(&h, &upload, "1.2.0", payload).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let manifest = body_json(resp).await;
        assert_eq!(manifest["fileSize"], payload.len());
        assert_eq!(manifest["fileHash"], hex::encode(Sha256::digest(payload)));
        assert_eq!(manifest["mandatory"], true);
        assert_eq!(manifest["releaseNotes"], "fixes");

        let resp = publish(&h, &upload, "1.2.0", payload).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app1/versions/latest?channel=stable",
                None,
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["version"], "1.2.0");

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app1/download/stable/1.2.0",
                Some(&download),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_LENGTH],
            payload.len().to_string().as_str()
        );
        assert_eq!(body_bytes(resp).await, payload);
    }

    #[tokio::test]
    async fn download_requires_download_scope() {
        let h = harness();
        let (upload, _, _) = onboard(&h).await;
        publish(&h, &upload, "1.0.0", b"x").await;

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app1/download/stable/1.0.0",
                None,
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app1/download/stable/1.0.0",
                Some(&upload),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app1/download/stable/1.0.0",
                Some(&h.admin),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn token_scoped_to_other_program_is_forbidden() {
        let h = harness();
        let (_, download, _) = onboard(&h).await;
        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app2/download/stable/1.0.0",
                Some(&download),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn latest_without_versions_is_404() {
        let h = harness();
        onboard(&h).await;
        let resp = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/api/programs/app1/versions/latest",
                None,
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({"error": "no version found"}));
    }

    #[tokio::test]
    async fn regenerate_invalidates_previous_token() {
        let h = harness();
        let (_, download, _) = onboard(&h).await;

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/api/programs/app1/tokens/regenerate?type=download",
                Some(&h.admin),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["type"], "download");
        let fresh = body["token"].as_str().unwrap().to_owned();

        assert!(h.state.tokens.validate(&download).is_err());
        assert!(h.state.tokens.validate(&fresh).is_ok());

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/api/programs/app1/tokens/regenerate?type=admin",
                Some(&h.admin),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn revoke_token_endpoint() {
        let h = harness();
        let (upload, _, _) = onboard(&h).await;
        let token_id = crate::tokens::token_id_for(&upload);

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "DELETE",
                &format!("/api/tokens/{token_id}"),
                Some(&h.admin),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = publish(&h, &upload, "1.0.0", b"x").await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "DELETE",
                "/api/tokens/unknown",
                Some(&h.admin),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn encryption_key_rotation() {
        let h = harness();
        let (_, _, original) = onboard(&h).await;
        let resp = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/api/programs/app1/encryption/regenerate",
                Some(&h.admin),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rotated = body_json(resp).await["encryptionKey"]
            .as_str()
            .unwrap()
            .to_owned();
        assert_ne!(rotated, original);
    }

    #[tokio::test]
    async fn delete_version_removes_file() {
        let h = harness();
        let (upload, _, _) = onboard(&h).await;
        publish(&h, &upload, "1.0.0", b"x").await;
        let path = h.state.packages.path("app1", "stable", "1.0.0");
        assert!(path.exists());

        let resp = h
            .app
            .clone()
            .oneshot(request(
                "DELETE",
                "/api/programs/app1/versions/stable/1.0.0",
                Some(&upload),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn encrypted_admin_request_round_trip() {
        let h = harness();
        onboard(&h).await;
        let sealed = h
            .state
            .crypto
            .encrypt(br#"{"programId":"app2"}"#, "app2")
            .unwrap();
        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/programs?programId=app2",
                Some(&h.admin),
                serde_json::to_value(&sealed).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let envelope: crate::crypto::EncryptedEnvelope =
            serde_json::from_value(body_json(resp).await).unwrap();
        let opened = h.state.crypto.decrypt(&envelope, "app2").unwrap();
        let body: Value = serde_json::from_slice(&opened).unwrap();
        assert_eq!(body["program"]["programId"], "app2");
    }

    async fn call(h: &Harness, method: &str, uri: &str, token: Option<&str>) -> Response {
        h.app
            .clone()
            .oneshot(request(method, uri, token, Body::empty()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn get_program_shows_key_and_active_tokens() {
        let h = harness();
        let (_, download, key) = onboard(&h).await;

        let resp = call(&h, "GET", "/api/programs/app1", Some(&download)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = call(&h, "GET", "/api/programs/app1", Some(&h.admin)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["program"]["programId"], "app1");
        assert_eq!(body["program"]["active"], true);
        assert_eq!(body["encryptionKey"], key.as_str());
        assert_eq!(body["tokens"].as_array().unwrap().len(), 2);
        assert!(!body.to_string().contains(&download));

        let resp = call(&h, "GET", "/api/programs/ghost", Some(&h.admin)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deleted_program_is_inactive_and_locked() {
        let h = harness();
        let (upload, download, _) = onboard(&h).await;
        assert_eq!(publish(&h, &upload, "1.0.0", b"kept").await.status(), StatusCode::CREATED);

        let resp = call(&h, "DELETE", "/api/programs/app1", Some(&upload)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = call(&h, "DELETE", "/api/programs/app1", Some(&h.admin)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["deleted"], true);
        assert_eq!(body["revokedTokens"].as_array().unwrap().len(), 2);

        // Tokens issued before the delete are dead.
        assert_eq!(
            publish(&h, &upload, "1.1.0", b"new").await.status(),
            StatusCode::UNAUTHORIZED
        );
        let resp = call(
            &h,
            "GET",
            "/api/programs/app1/download/stable/1.0.0",
            Some(&download),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // A fresh upload token still cannot publish into an inactive program.
        let fresh = h
            .state
            .tokens
            .issue("app1", TokenKind::Upload, "test")
            .unwrap()
            .secret;
        assert_eq!(publish(&h, &fresh, "1.1.0", b"new").await.status(), StatusCode::NOT_FOUND);

        let resp = call(
            &h,
            "POST",
            "/api/programs/app1/tokens/regenerate?type=upload",
            Some(&h.admin),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = call(&h, "GET", "/api/programs/app1", Some(&h.admin)).await;
        let body = body_json(resp).await;
        assert_eq!(body["program"]["active"], false);
        assert_eq!(body["tokens"].as_array().unwrap().len(), 0);

        // Published versions stay readable.
        let resp = call(&h, "GET", "/api/programs/app1/versions/latest", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["version"], "1.0.0");

        let resp = call(&h, "DELETE", "/api/programs/ghost", Some(&h.admin)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concurrent_publish_of_one_version_has_one_winner() {
        let h = harness();
        let (upload, _, _) = onboard(&h).await;
        let first = vec![b'a'; 64 * 1024];
        let second = vec![b'b'; 64 * 1024];

        let (r1, r2) = tokio::join!(
            publish(&h, &upload, "2.0.0", &first),
            publish(&h, &upload, "2.0.0", &second)
        );
        let mut codes = [r1.status(), r2.status()];
        codes.sort();
        assert_eq!(codes, [StatusCode::CREATED, StatusCode::CONFLICT]);

        let record = h
            .state
            .store
            .get_version("app1", "stable", "2.0.0")
            .unwrap()
            .unwrap();
        let on_disk = std::fs::read(h.state.packages.path("app1", "stable", "2.0.0")).unwrap();
        assert_eq!(record.file_hash, hex::encode(Sha256::digest(&on_disk)));
        assert!(on_disk == first || on_disk == second);
    }
}

