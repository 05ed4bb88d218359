use anyhow::Result;
use redb::{ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};

use super::db::{decode, encode};

pub(crate) const TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("tokens");

/// Tenant scope that matches every program.
pub const ANY_PROGRAM: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Admin,
    Upload,
    Download,
}

impl TokenKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "upload" => Some(Self::Upload),
            "download" => Some(Self::Download),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scoped bearer credential. Only the SHA-256 of the secret is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Hex SHA-256 of the bearer secret; the lookup key.
    pub token_id: String,
    /// Program ID or [`ANY_PROGRAM`].
    pub program_id: String,
    pub kind: TokenKind,
    pub created_by: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub active: bool,
}

impl TokenRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// Deactivate every active token matching `pred` inside an open write
/// transaction. Returns the IDs that were deactivated.
pub(crate) fn deactivate_where(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    pred: impl Fn(&TokenRecord) -> bool,
) -> Result<Vec<String>> {
    let mut matched = Vec::new();
    for item in table.iter()? {
        let (_k, v) = item?;
        let record: TokenRecord = decode(v.value())?;
        if record.active && pred(&record) {
            matched.push(record);
        }
    }

    let mut revoked = Vec::with_capacity(matched.len());
    for mut record in matched {
        record.active = false;
        let bytes = encode(&record)?;
        table.insert(record.token_id.as_str(), bytes.as_slice())?;
        revoked.push(record.token_id);
    }
    Ok(revoked)
}

impl super::db::Store {
    pub fn put_token(&self, record: &TokenRecord) -> Result<()> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TOKENS)?;
            table.insert(record.token_id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_token(&self, token_id: &str) -> Result<Option<TokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        match table.get(token_id)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List tokens, optionally restricted to one program. Inactive records are included.
    pub fn list_tokens(&self, program_id: Option<&str>) -> Result<Vec<TokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record: TokenRecord = decode(v.value())?;
            if program_id.map_or(true, |p| record.program_id == p) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub fn find_active_token(
        &self,
        program_id: &str,
        kind: TokenKind,
    ) -> Result<Option<TokenRecord>> {
        Ok(self
            .list_tokens(Some(program_id))?
            .into_iter()
            .rev()
            .find(|r| r.active && r.kind == kind))
    }

    /// Mark a token inactive. Returns false if the ID is unknown.
    pub fn deactivate_token(&self, token_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(TOKENS)?;
            let current: Option<TokenRecord> = match table.get(token_id)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(mut record) => {
                    record.active = false;
                    let bytes = encode(&record)?;
                    table.insert(token_id, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Deactivate every active token with the same (program, kind) as
    /// `replacement` and insert `replacement`, in one transaction.
    /// Returns the IDs that were deactivated.
    pub fn replace_active_token(&self, replacement: &TokenRecord) -> Result<Vec<String>> {
        let write_txn = self.db.begin_write()?;
        let revoked = {
            let mut table = write_txn.open_table(TOKENS)?;

            let revoked = deactivate_where(&mut table, |r| {
                r.kind == replacement.kind && r.program_id == replacement.program_id
            })?;

            let bytes = encode(replacement)?;
            table.insert(replacement.token_id.as_str(), bytes.as_slice())?;
            revoked
        };
        write_txn.commit()?;
        Ok(revoked)
    }

    /// Return the newest active token with the same (program, kind) as
    /// `candidate`, or insert `candidate` when there is none. Lookup and
    /// insert share one write transaction, so concurrent callers agree on a
    /// single token. `None` means `candidate` was inserted.
    pub fn get_or_insert_active_token(
        &self,
        candidate: &TokenRecord,
    ) -> Result<Option<TokenRecord>> {
        let write_txn = self.db.begin_write()?;
        let existing = {
            let mut table = write_txn.open_table(TOKENS)?;

            let mut newest: Option<TokenRecord> = None;
            for item in table.iter()? {
                let (_k, v) = item?;
                let record: TokenRecord = decode(v.value())?;
                if record.active
                    && record.kind == candidate.kind
                    && record.program_id == candidate.program_id
                    && newest
                        .as_ref()
                        .map_or(true, |n| record.created_at >= n.created_at)
                {
                    newest = Some(record);
                }
            }

            if newest.is_none() {
                let bytes = encode(candidate)?;
                table.insert(candidate.token_id.as_str(), bytes.as_slice())?;
            }
            newest
        };
        write_txn.commit()?;
        Ok(existing)
    }

    /// Record a successful use of a token.
    pub fn touch_token(&self, token_id: &str, now: i64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TOKENS)?;
            let current: Option<TokenRecord> = match table.get(token_id)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(mut record) = current {
                record.last_used_at = Some(now);
                let bytes = encode(&record)?;
                table.insert(token_id, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
