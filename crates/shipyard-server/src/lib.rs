pub mod auth;
pub mod crypto;
pub mod envelope;
pub mod handlers;
pub mod server;
pub mod storage;
pub mod store;
pub mod tokens;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub tokens: tokens::TokenAuthority,
    pub crypto: crypto::CryptoEnvelope,
    pub packages: storage::PackageStorage,
    /// Upper bound for a single package upload.
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn new(
        store: store::Store,
        master_secret: &str,
        packages: storage::PackageStorage,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            tokens: tokens::TokenAuthority::new(store.clone()),
            crypto: crypto::CryptoEnvelope::new(master_secret),
            store,
            packages,
            max_upload_bytes,
        }
    }
}

pub use server::{build_router, open_store, read_key_file, resolve_data_dir, resolve_master_key, run, ServerConfig};
