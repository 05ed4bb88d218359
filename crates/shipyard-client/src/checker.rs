use reqwest::StatusCode;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::UpdateError;
use crate::types::UpdateManifest;
use crate::version::is_newer;

pub(crate) fn http_client(config: &ClientConfig) -> Result<reqwest::Client, UpdateError> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(concat!("shipyard-client/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| UpdateError::Config(format!("http client: {e}")))
}

/// Queries the public version catalog.
#[derive(Clone)]
pub struct UpdateChecker {
    http: reqwest::Client,
    base_url: String,
    program_id: String,
    channel: String,
}

impl UpdateChecker {
    pub fn new(config: &ClientConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        Ok(Self::with_client(http_client(config)?, config))
    }

    pub(crate) fn with_client(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            http,
            base_url: config.base_url().to_owned(),
            program_id: config.program_id.clone(),
            channel: config.channel.clone(),
        }
    }

    pub fn latest_url(&self) -> String {
        format!(
            "{}/api/programs/{}/versions/latest?channel={}",
            self.base_url, self.program_id, self.channel
        )
    }

    pub fn manifest_url(&self, version: &str) -> String {
        format!(
            "{}/api/programs/{}/versions/{}/{}",
            self.base_url, self.program_id, self.channel, version
        )
    }

    /// Newest manifest in the configured channel.
    pub async fn latest(&self) -> Result<UpdateManifest, UpdateError> {
        self.get_manifest(&self.latest_url()).await
    }

    /// Manifest for a specific version in the configured channel.
    pub async fn manifest(&self, version: &str) -> Result<UpdateManifest, UpdateError> {
        self.get_manifest(&self.manifest_url(version)).await
    }

    /// `Some(manifest)` when the channel holds a version newer than `current`.
    pub async fn check(&self, current: &str) -> Result<Option<UpdateManifest>, UpdateError> {
        let latest = self.latest().await?;
        debug!(current, latest = %latest.version, "compared versions");
        Ok(is_newer(&latest.version, current).then_some(latest))
    }

    async fn get_manifest(&self, url: &str) -> Result<UpdateManifest, UpdateError> {
        let response = self.http.get(url).send().await?;
        match response.status() {
            s if s.is_success() => response
                .json::<UpdateManifest>()
                .await
                .map_err(|e| UpdateError::Parse(e.to_string())),
            StatusCode::NOT_FOUND => Err(UpdateError::NoVersion),
            _ => Err(UpdateError::from_response(response).await),
        }
    }
}
