use std::path::PathBuf;

use axum::body::Body;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("package exceeds the {limit} byte upload limit")]
    TooLarge { limit: u64 },
    #[error("upload interrupted: {0}")]
    Body(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What was written for a package.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPackage {
    pub file_name: String,
    pub size: u64,
    /// Lowercase hex SHA-256.
    pub hash: String,
}

/// Accepts `[A-Za-z0-9._-]{1,64}` except `.` and `..`.
pub fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s != "."
        && s != ".."
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Package files under `{root}/{program}/{channel}/{version}/`.
#[derive(Clone)]
pub struct PackageStorage {
    root: PathBuf,
}

impl PackageStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn file_name(program_id: &str, version: &str) -> String {
        format!("{program_id}-{version}.pkg")
    }

    pub fn path(&self, program_id: &str, channel: &str, version: &str) -> PathBuf {
        self.root
            .join(program_id)
            .join(channel)
            .join(version)
            .join(Self::file_name(program_id, version))
    }

    /// Stream `body` to disk, hashing as it is written. Each call writes its
    /// own temporary file next to the destination, and the file only appears
    /// at its final path once the whole body has been received. A failed
    /// upload removes its temporary file and nothing else.
    ///
    /// Callers must hold the catalog reservation for the version.
    pub async fn save(
        &self,
        program_id: &str,
        channel: &str,
        version: &str,
        body: Body,
        limit: u64,
    ) -> Result<StoredPackage, StorageError> {
        let dest = self.path(program_id, channel, version);
        let dir = dest
            .parent()
            .ok_or_else(|| std::io::Error::other("package path has no parent"))?;
        fs::create_dir_all(dir).await?;

        let file_name = Self::file_name(program_id, version);
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".partial")
            .tempfile_in(dir)?;
        let file = fs::File::from_std(partial.as_file().try_clone()?);

        // Dropping `partial` on the error path deletes the temporary file.
        let (size, hash) = write_hashed(file, body, limit).await?;
        partial.persist(&dest).map_err(|e| e.error)?;

        debug!(path = %dest.display(), size, "stored package");
        Ok(StoredPackage {
            file_name,
            size,
            hash,
        })
    }

    /// Remove a stored package and its now-empty version directory.
    pub async fn delete(
        &self,
        program_id: &str,
        channel: &str,
        version: &str,
    ) -> Result<(), StorageError> {
        let path = self.path(program_id, channel, version);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir(dir).await;
        }
        Ok(())
    }
}

async fn write_hashed(
    mut file: fs::File,
    body: Body,
    limit: u64,
) -> Result<(u64, String), StorageError> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| StorageError::Body(e.to_string()))?;
        size += chunk.len() as u64;
        if size > limit {
            return Err(StorageError::TooLarge { limit });
        }
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn segment_rules() {
        assert!(valid_segment("app1"));
        assert!(valid_segment("1.2.0-beta_1"));
        assert!(!valid_segment(""));
        assert!(!valid_segment("."));
        assert!(!valid_segment(".."));
        assert!(!valid_segment("a/b"));
        assert!(!valid_segment("a b"));
        assert!(!valid_segment(&"x".repeat(65)));
    }

    #[tokio::test]
    async fn save_hashes_and_places_file() {
        let dir = tempdir().unwrap();
        let storage = PackageStorage::new(dir.path());
        let stored = storage
            .save("app1", "stable", "1.0.0", Body::from("hello"), 1024)
            .await
            .unwrap();

        assert_eq!(stored.size, 5);
        assert_eq!(stored.file_name, "app1-1.0.0.pkg");
        assert_eq!(
            stored.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let path = storage.path("app1", "stable", "1.0.0");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn oversize_upload_leaves_nothing() {
        let dir = tempdir().unwrap();
        let storage = PackageStorage::new(dir.path());
        let err = storage
            .save("app1", "stable", "1.0.0", Body::from(vec![0u8; 100]), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { limit: 10 }));

        let path = storage.path("app1", "stable", "1.0.0");
        assert!(!path.exists());
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    /// A body that yields `chunks` 4 KiB chunks of `byte`, yielding to the
    /// scheduler before each one.
    fn trickle(byte: u8, chunks: usize) -> Body {
        let stream = futures::stream::unfold(0, move |i| async move {
            if i == chunks {
                return None;
            }
            tokio::task::yield_now().await;
            Some((Ok::<_, std::io::Error>(vec![byte; 4096]), i + 1))
        });
        Body::from_stream(stream)
    }

    #[tokio::test]
    async fn interleaved_saves_never_mix_bytes() {
        let dir = tempdir().unwrap();
        let storage = PackageStorage::new(dir.path());

        let (a, b) = tokio::join!(
            storage.save("app1", "stable", "1.0.0", trickle(b'A', 64), 1 << 20),
            storage.save("app1", "stable", "1.0.0", trickle(b'B', 64), 1 << 20),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.hash, b.hash);

        let path = storage.path("app1", "stable", "1.0.0");
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 64 * 4096);
        assert!(on_disk.iter().all(|&c| c == on_disk[0]));
        let disk_hash = hex::encode(Sha256::digest(&on_disk));
        assert!(disk_hash == a.hash || disk_hash == b.hash);

        // Only the package itself remains.
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = PackageStorage::new(dir.path());
        storage
            .save("app1", "stable", "1.0.0", Body::from("x"), 1024)
            .await
            .unwrap();
        storage.delete("app1", "stable", "1.0.0").await.unwrap();
        storage.delete("app1", "stable", "1.0.0").await.unwrap();
        assert!(!storage.path("app1", "stable", "1.0.0").exists());
    }
}
