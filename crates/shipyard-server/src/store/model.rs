use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// A tenant: an isolated namespace with its own tokens, key and catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub program_id: String,
    pub name: String,
    pub description: String,
    pub active: bool,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// Published version metadata. Stored in redb as bincode and served as the
/// update manifest JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub program_id: String,
    pub version: String,
    pub channel: String,
    pub file_name: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the stored package.
    pub file_hash: String,
    pub release_notes: String,
    pub publish_date: DateTime<Utc>,
    pub mandatory: bool,
    pub download_count: u64,
}

impl VersionRecord {
    /// Catalog key; (program, channel, version) is unique.
    pub fn catalog_key(program_id: &str, channel: &str, version: &str) -> String {
        format!("{program_id}/{channel}/{version}")
    }

    pub fn key(&self) -> String {
        Self::catalog_key(&self.program_id, &self.channel, &self.version)
    }
}

/// Random 32-byte key a program's clients use to decrypt packages.
/// Base64 encoded. Distinct from the derived envelope key.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct PackageKey {
    pub key: String,
    pub created_at: i64,
    pub updated_at: i64,
}
