use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::checker::{http_client, UpdateChecker};
use crate::config::ClientConfig;
use crate::decrypt::PackageDecryptor;
use crate::downloader::{Downloader, Sleeper, TokioSleeper};
use crate::error::UpdateError;
use crate::types::{DownloadProgress, DownloadResult, UpdateManifest};
use crate::verify::{digests_match, file_digest};

/// Check, fetch, verify and decrypt in one call.
pub struct UpdateClient<S = TokioSleeper> {
    config: ClientConfig,
    checker: UpdateChecker,
    downloader: Downloader<S>,
}

impl UpdateClient<TokioSleeper> {
    pub fn new(config: ClientConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        let http = http_client(&config)?;
        Ok(Self {
            checker: UpdateChecker::with_client(http.clone(), &config),
            downloader: Downloader::with_client(http, &config),
            config,
        })
    }
}

impl<S: Sleeper> UpdateClient<S> {
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> UpdateClient<T> {
        UpdateClient {
            config: self.config,
            checker: self.checker,
            downloader: self.downloader.with_sleeper(sleeper),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn checker(&self) -> &UpdateChecker {
        &self.checker
    }

    pub async fn check_update(&self, current: &str) -> Result<Option<UpdateManifest>, UpdateError> {
        self.checker.check(current).await
    }

    /// Resolve where `version` lands when the caller gives no path.
    pub fn default_output(&self, version: &str) -> PathBuf {
        self.config
            .output_path(version, chrono::Local::now().date_naive())
    }

    /// Download `version`, verify it against its manifest digest and decrypt
    /// it in place when a package key is configured.
    ///
    /// Verification always precedes decryption: on a digest mismatch the file
    /// is left as downloaded and the decryptor never runs.
    pub async fn download_update<F>(
        &self,
        version: &str,
        output: Option<&Path>,
        on_progress: F,
    ) -> Result<DownloadResult, UpdateError>
    where
        F: FnMut(&DownloadProgress) + Send,
    {
        // Reject a malformed key before touching the network or the disk.
        let decryptor = self
            .config
            .encryption_key
            .as_deref()
            .map(PackageDecryptor::new)
            .transpose()?;

        let manifest = self.checker.manifest(version).await?;
        let dest = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_output(&manifest.version));

        let mut file_size = self
            .downloader
            .fetch(&self.config.channel, &manifest.version, &dest, on_progress)
            .await?;

        let verified = if manifest.file_hash.is_empty() {
            warn!(version = %manifest.version, "manifest has no hash; skipping verification");
            false
        } else {
            let path = dest.clone();
            let actual = tokio::task::spawn_blocking(move || file_digest(&path))
                .await
                .map_err(|e| UpdateError::File(std::io::Error::other(e)))??;
            if !digests_match(&actual, &manifest.file_hash) {
                return Err(UpdateError::Verification {
                    expected: manifest.file_hash.to_lowercase(),
                    actual,
                });
            }
            true
        };

        let decrypted = match decryptor {
            Some(decryptor) => {
                let path = dest.clone();
                tokio::task::spawn_blocking(move || decryptor.decrypt_file(&path, &path))
                    .await
                    .map_err(|e| UpdateError::File(std::io::Error::other(e)))??;
                file_size = tokio::fs::metadata(&dest).await?.len();
                true
            }
            None => false,
        };

        info!(
            version = %manifest.version,
            path = %dest.display(),
            verified,
            decrypted,
            "update ready"
        );
        Ok(DownloadResult {
            success: true,
            file: dest.display().to_string(),
            file_size,
            verified,
            decrypted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::decrypt::encrypt_package;

    #[derive(Clone, Copy, Default)]
    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }
    }

    async fn serve_package(server: &MockServer, body: Vec<u8>, hash: &str) {
        Mock::given(method("GET"))
            .and(path("/api/programs/app1/versions/stable/1.2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "version": "1.2.0",
                "channel": "stable",
                "fileName": "app1-1.2.0.pkg",
                "fileSize": body.len(),
                "fileHash": hash,
                "releaseNotes": "",
                "publishDate": "2024-05-01T12:00:00Z",
                "mandatory": false
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/programs/app1/download/stable/1.2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    fn client(server: &MockServer, save: &Path, key: Option<String>) -> UpdateClient<NoSleep> {
        let mut config = ClientConfig::new(server.uri(), "app1");
        config.token = Some("dl".into());
        config.encryption_key = key;
        config.save_path = save.to_path_buf();
        config.naming = crate::config::OutputNaming::Version;
        UpdateClient::new(config).unwrap().with_sleeper(NoSleep)
    }

    /// Encrypt `plain` with `key` and return the package bytes.
    fn sealed_package(plain: &[u8], key: &str) -> Vec<u8> {
        let dir = tempdir().unwrap();
        let src = dir.path().join("plain");
        let dst = dir.path().join("sealed");
        std::fs::write(&src, plain).unwrap();
        encrypt_package(&src, &dst, key).unwrap();
        std::fs::read(&dst).unwrap()
    }

    #[tokio::test]
    async fn downloads_verifies_and_decrypts() {
        let key = B64.encode([9u8; 32]);
        let plain = b"zip archive contents".to_vec();
        let package = sealed_package(&plain, &key);
        let hash = hex::encode(Sha256::digest(&package));

        let server = MockServer::start().await;
        serve_package(&server, package, &hash).await;

        let dir = tempdir().unwrap();
        let c = client(&server, dir.path(), Some(key));
        let result = c.download_update("1.2.0", None, |_| {}).await.unwrap();

        let expected = dir.path().join("app1-v1.2.0.zip");
        assert_eq!(result.file, expected.display().to_string());
        assert!(result.verified);
        assert!(result.decrypted);
        assert_eq!(result.file_size, plain.len() as u64);
        assert_eq!(std::fs::read(&expected).unwrap(), plain);
    }

    #[tokio::test]
    async fn digest_mismatch_skips_decryption() {
        let key = B64.encode([9u8; 32]);
        let package = sealed_package(b"payload", &key);

        let server = MockServer::start().await;
        serve_package(&server, package.clone(), &"0".repeat(64)).await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("pkg.zip");
        let c = client(&server, dir.path(), Some(key));
        let err = c
            .download_update("1.2.0", Some(&out), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Verification { .. }));
        // Still the encrypted bytes: decryption never ran.
        assert_eq!(std::fs::read(&out).unwrap(), package);
    }

    #[tokio::test]
    async fn empty_hash_skips_verification() {
        let server = MockServer::start().await;
        serve_package(&server, b"plain".to_vec(), "").await;

        let dir = tempdir().unwrap();
        let c = client(&server, dir.path(), None);
        let result = c.download_update("1.2.0", None, |_| {}).await.unwrap();
        assert!(!result.verified);
        assert!(!result.decrypted);
        assert_eq!(result.file_size, 5);
    }

    #[tokio::test]
    async fn bad_key_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let c = client(&server, dir.path(), Some(B64.encode([1u8; 10])));
        let err = c.download_update("1.2.0", None, |_| {}).await.unwrap_err();
        assert!(matches!(err, UpdateError::Config(_)));
    }
}
