use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-declared metadata for one published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    pub version: String,
    pub channel: String,
    pub file_name: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256; empty when the server did not record one.
    #[serde(default)]
    pub file_hash: String,
    #[serde(default)]
    pub release_notes: String,
    pub publish_date: DateTime<Utc>,
    #[serde(default)]
    pub mandatory: bool,
}

/// A progress sample for one download attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    #[serde(skip)]
    pub version: String,
    pub downloaded: u64,
    pub total: u64,
    pub percentage: f64,
    /// Bytes per second since the attempt started.
    pub speed: f64,
}

/// Outcome of a completed download pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub success: bool,
    pub file: String,
    pub file_size: u64,
    pub verified: bool,
    pub decrypted: bool,
}
