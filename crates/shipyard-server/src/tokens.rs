use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::store::{Store, TokenKind, TokenRecord, ANY_PROGRAM};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("token store: {0}")]
    Store(#[from] anyhow::Error),
}

/// A token as handed to its owner. `secret` exists only here.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub record: TokenRecord,
    pub secret: String,
}

/// Generate a bearer secret: 32 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Token ID for a bearer secret: hex SHA-256.
pub fn token_id_for(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Issues, validates and revokes scoped bearer tokens.
#[derive(Clone)]
pub struct TokenAuthority {
    store: Store,
}

impl TokenAuthority {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Build a new active record and its secret without persisting it.
    /// Fails when `ttl` puts the expiry beyond the timestamp range.
    pub fn mint(
        program_id: &str,
        kind: TokenKind,
        created_by: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken> {
        let secret = generate_secret();
        let now = Store::now();
        let expires_at = match ttl {
            Some(d) => Some(
                i64::try_from(d.as_secs())
                    .ok()
                    .and_then(|secs| now.checked_add(secs))
                    .with_context(|| format!("token lifetime too long: {}s", d.as_secs()))?,
            ),
            None => None,
        };
        let record = TokenRecord {
            token_id: token_id_for(&secret),
            program_id: program_id.to_owned(),
            kind,
            created_by: created_by.to_owned(),
            created_at: now,
            expires_at,
            last_used_at: None,
            active: true,
        };
        Ok(IssuedToken { record, secret })
    }

    pub fn issue(&self, program_id: &str, kind: TokenKind, created_by: &str) -> Result<IssuedToken> {
        self.issue_expiring(program_id, kind, created_by, None)
    }

    pub fn issue_expiring(
        &self,
        program_id: &str,
        kind: TokenKind,
        created_by: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken> {
        let issued = Self::mint(program_id, kind, created_by, ttl)?;
        self.store.put_token(&issued.record)?;
        info!(program = %program_id, kind = %kind, "issued token");
        Ok(issued)
    }

    /// Resolve a bearer secret to its active, unexpired record.
    ///
    /// On success the record's `last_used_at` is refreshed by a detached
    /// task. That write is best-effort: it never delays or fails this call.
    pub fn validate(&self, secret: &str) -> Result<TokenRecord, AuthError> {
        let token_id = token_id_for(secret);
        let record = match self.store.get_token(&token_id)? {
            Some(r) if r.active => r,
            _ => return Err(AuthError::InvalidToken),
        };

        let now = Store::now();
        if record.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }

        self.touch_detached(token_id, now);
        Ok(record)
    }

    fn touch_detached(&self, token_id: String, now: i64) {
        let store = self.store.clone();
        let touch = move || {
            if let Err(e) = store.touch_token(&token_id, now) {
                warn!(error = %e, "failed to record token use");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(touch);
            }
            Err(_) => {
                std::thread::spawn(touch);
            }
        }
    }

    /// Admin satisfies every requirement; otherwise the kind must match and
    /// the token must be scoped to `program_id` or to every program.
    pub fn has_permission(record: &TokenRecord, required: TokenKind, program_id: &str) -> bool {
        if record.kind == TokenKind::Admin {
            return true;
        }
        record.kind == required
            && (record.program_id == ANY_PROGRAM || record.program_id == program_id)
    }

    /// Deactivate a token. Returns false if the ID is unknown.
    pub fn revoke(&self, token_id: &str) -> Result<bool> {
        let existed = self.store.deactivate_token(token_id)?;
        if existed {
            info!(token = %token_id, "revoked token");
        }
        Ok(existed)
    }

    /// Revoke the active token(s) of (program, kind) and issue a replacement,
    /// atomically.
    pub fn regenerate(
        &self,
        program_id: &str,
        kind: TokenKind,
        created_by: &str,
    ) -> Result<IssuedToken> {
        let issued = Self::mint(program_id, kind, created_by, None)?;
        let revoked = self.store.replace_active_token(&issued.record)?;
        info!(program = %program_id, kind = %kind, revoked = revoked.len(), "regenerated token");
        Ok(issued)
    }

    /// Return the active token of (program, kind), issuing one if none exists.
    /// The secret is only available when a token was issued by this call.
    pub fn get_or_create(
        &self,
        program_id: &str,
        kind: TokenKind,
        created_by: &str,
    ) -> Result<(TokenRecord, Option<String>)> {
        let issued = Self::mint(program_id, kind, created_by, None)?;
        match self.store.get_or_insert_active_token(&issued.record)? {
            Some(existing) => {
                debug!(program = %program_id, kind = %kind, "reusing active token");
                Ok((existing, None))
            }
            None => {
                info!(program = %program_id, kind = %kind, "issued token");
                Ok((issued.record, Some(issued.secret)))
            }
        }
    }

    pub fn list(&self, program_id: Option<&str>) -> Result<Vec<TokenRecord>> {
        self.store.list_tokens(program_id)
    }
}
