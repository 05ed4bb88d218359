use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::model::{PackageKey, Program, VersionRecord};
use super::tokens::{deactivate_where, TokenRecord, TOKENS};

const PROGRAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("programs");
const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");
const PACKAGE_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("package_keys");
/// Catalog keys with an upload in flight, valued by reservation time.
const PENDING_UPLOADS: TableDefinition<&str, i64> = TableDefinition::new("pending_uploads");

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(PROGRAMS)?;
        write_txn.open_table(VERSIONS)?;
        write_txn.open_table(PACKAGE_KEYS)?;
        write_txn.open_table(TOKENS)?;
        // Reservations never outlive the process that made them.
        write_txn.delete_table(PENDING_UPLOADS)?;
        write_txn.open_table(PENDING_UPLOADS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    // ── Programs ──────────────────────────────────────────────────────────

    /// Onboard a program: record, package key and initial tokens in one
    /// transaction. Returns false (and writes nothing) if the ID is taken.
    pub fn create_program(
        &self,
        program: &Program,
        key: &PackageKey,
        tokens: &[TokenRecord],
    ) -> Result<bool> {
        let program_bytes = encode(program)?;
        let key_bytes = encode(key)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut programs = write_txn.open_table(PROGRAMS)?;
            if programs.get(program.program_id.as_str())?.is_some() {
                return Ok(false);
            }
            programs.insert(program.program_id.as_str(), program_bytes.as_slice())?;

            let mut keys = write_txn.open_table(PACKAGE_KEYS)?;
            keys.insert(program.program_id.as_str(), key_bytes.as_slice())?;

            let mut table = write_txn.open_table(TOKENS)?;
            for token in tokens {
                let bytes = encode(token)?;
                table.insert(token.token_id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;

        debug!(program = %program.program_id, "created program");
        Ok(true)
    }

    pub fn get_program(&self, program_id: &str) -> Result<Option<Program>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROGRAMS)?;
        match table.get(program_id)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_programs(&self) -> Result<Vec<Program>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROGRAMS)?;

        let mut programs = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            programs.push(decode(v.value())?);
        }
        Ok(programs)
    }

    /// Mark a program inactive and deactivate every token bound to it, in
    /// one transaction. Returns `None` if the program is unknown, otherwise
    /// the deactivated token IDs. Versions and package files are kept.
    pub fn soft_delete_program(&self, program_id: &str) -> Result<Option<Vec<String>>> {
        let write_txn = self.db.begin_write()?;
        let revoked = {
            let mut programs = write_txn.open_table(PROGRAMS)?;
            let current: Option<Program> = match programs.get(program_id)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let Some(mut program) = current else {
                return Ok(None);
            };
            program.active = false;
            let bytes = encode(&program)?;
            programs.insert(program_id, bytes.as_slice())?;

            let mut tokens = write_txn.open_table(TOKENS)?;
            deactivate_where(&mut tokens, |r| r.program_id == program_id)?
        };
        write_txn.commit()?;

        debug!(program = %program_id, revoked = revoked.len(), "soft-deleted program");
        Ok(Some(revoked))
    }

    // ── Package keys ──────────────────────────────────────────────────────

    pub fn get_package_key(&self, program_id: &str) -> Result<Option<PackageKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PACKAGE_KEYS)?;
        match table.get(program_id)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Replace a program's package key, keeping its original creation time.
    pub fn replace_package_key(&self, program_id: &str, key: String) -> Result<PackageKey> {
        let now = Self::now();
        let write_txn = self.db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(PACKAGE_KEYS)?;
            let created_at = match table.get(program_id)? {
                Some(guard) => decode::<PackageKey>(guard.value())?.created_at,
                None => now,
            };
            let stored = PackageKey {
                key,
                created_at,
                updated_at: now,
            };
            let bytes = encode(&stored)?;
            table.insert(program_id, bytes.as_slice())?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    // ── Version catalog ───────────────────────────────────────────────────

    /// Claim (program, channel, version) for an upload. Fails when the
    /// version is already published or another upload holds the claim.
    pub fn reserve_version(&self, program_id: &str, channel: &str, version: &str) -> Result<bool> {
        let key = VersionRecord::catalog_key(program_id, channel, version);
        let write_txn = self.db.begin_write()?;
        {
            let versions = write_txn.open_table(VERSIONS)?;
            if versions.get(key.as_str())?.is_some() {
                return Ok(false);
            }
            let mut pending = write_txn.open_table(PENDING_UPLOADS)?;
            if pending.get(key.as_str())?.is_some() {
                return Ok(false);
            }
            pending.insert(key.as_str(), Self::now())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Drop an upload claim without publishing.
    pub fn release_version(&self, program_id: &str, channel: &str, version: &str) -> Result<()> {
        let key = VersionRecord::catalog_key(program_id, channel, version);
        let write_txn = self.db.begin_write()?;
        {
            let mut pending = write_txn.open_table(PENDING_UPLOADS)?;
            pending.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Publish a version record and drop any upload claim on its key.
    /// Returns false (and writes nothing) if the version already exists.
    pub fn insert_version(&self, record: &VersionRecord) -> Result<bool> {
        let key = record.key();
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(VERSIONS)?;
            if table.get(key.as_str())?.is_some() {
                return Ok(false);
            }
            table.insert(key.as_str(), bytes.as_slice())?;

            let mut pending = write_txn.open_table(PENDING_UPLOADS)?;
            pending.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    pub fn get_version(
        &self,
        program_id: &str,
        channel: &str,
        version: &str,
    ) -> Result<Option<VersionRecord>> {
        let key = VersionRecord::catalog_key(program_id, channel, version);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VERSIONS)?;
        match table.get(key.as_str())? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Versions of a program, newest first. `channel = None` spans all channels.
    pub fn list_versions(
        &self,
        program_id: &str,
        channel: Option<&str>,
    ) -> Result<Vec<VersionRecord>> {
        let prefix = match channel {
            Some(c) => format!("{program_id}/{c}/"),
            None => format!("{program_id}/"),
        };

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VERSIONS)?;

        let mut records: Vec<VersionRecord> = Vec::new();
        for item in table.range(prefix.as_str()..)? {
            let (k, v) = item?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            records.push(decode(v.value())?);
        }
        records.sort_by(|a, b| {
            b.publish_date
                .cmp(&a.publish_date)
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(records)
    }

    pub fn latest_version(&self, program_id: &str, channel: &str) -> Result<Option<VersionRecord>> {
        Ok(self
            .list_versions(program_id, Some(channel))?
            .into_iter()
            .next())
    }

    /// Remove a version record, returning it if it existed.
    pub fn delete_version(
        &self,
        program_id: &str,
        channel: &str,
        version: &str,
    ) -> Result<Option<VersionRecord>> {
        let key = VersionRecord::catalog_key(program_id, channel, version);
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(VERSIONS)?;
            let removed = table.remove(key.as_str())?;
            match removed {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn increment_download_count(
        &self,
        program_id: &str,
        channel: &str,
        version: &str,
    ) -> Result<()> {
        let key = VersionRecord::catalog_key(program_id, channel, version);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(VERSIONS)?;
            let current: Option<VersionRecord> = match table.get(key.as_str())? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(mut record) = current {
                record.download_count += 1;
                let bytes = encode(&record)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).context("bincode encode")
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(value)
}
