//! Content-addressed output cache (spec §4.4).
//!
//! Unlike the teacher's single-blob, zstd-compressed CAS keyed by a content
//! hash, this cache stores whole directory trees verbatim, keyed by
//! `(script, fingerprint hash)`: a script's declared outputs rarely compress
//! or dedupe well across scripts, and the spec mandates a recursive,
//! symlink-preserving copy rather than blob storage.

use std::path::Path;

use thiserror::Error;

use crate::{
    analyzer::ScriptReference,
    fs,
    path::{AbsDirPath, RelSomePath},
};

const REPLAY_DIR_NAME: &str = ".replay";
const STDOUT_REPLAY_NAME: &str = "stdout";
const STDERR_REPLAY_NAME: &str = "stderr";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry for {reference} at fingerprint {hash} already exists")]
    AlreadyExists { reference: String, hash: String },
    #[error("{0}")]
    Io(String),
}

fn io_err(e: impl std::fmt::Display) -> CacheError {
    CacheError::Io(e.to_string())
}

/// Captured stdout/stderr bytes to replay on a cache hit. A `None` field (or
/// an entry that was never written because it was empty) means nothing to
/// replay for that stream.
#[derive(Clone, Debug, Default)]
pub struct ReplayLogs {
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

/// Stores and retrieves cached output trees. A trait so a future driver can
/// layer a remote backend over this interface without touching the
/// Executor, mirroring how [`crate::manifest::ManifestSource`] and
/// [`crate::analyzer::PackageResolver`] keep this crate's core agnostic of
/// its environment.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, reference: &ScriptReference, fingerprint_hash: &str) -> Result<Option<CacheHit>, CacheError>;

    async fn set(
        &self,
        reference: &ScriptReference,
        fingerprint_hash: &str,
        package_dir: &AbsDirPath,
        paths: &[RelSomePath],
        replay: Option<&ReplayLogs>,
    ) -> Result<CacheHit, CacheError>;
}

/// A confirmed cache entry, ready to be materialized into a package
/// directory.
#[derive(Clone, Debug)]
pub struct CacheHit {
    cache_dir: AbsDirPath,
}

impl CacheHit {
    /// Copy every stored entry into `package_dir`, returning the replay logs
    /// captured at `set` time, if any.
    pub async fn apply(&self, package_dir: &AbsDirPath) -> Result<ReplayLogs, CacheError> {
        let mut entries = tokio::fs::read_dir(self.cache_dir.as_std_path()).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if entry.file_name() == REPLAY_DIR_NAME {
                continue;
            }
            let dst = package_dir.as_std_path().join(entry.file_name());
            copy_path(&entry.path(), &dst).await.map_err(io_err)?;
        }

        let replay_dir = self.cache_dir.as_std_path().join(REPLAY_DIR_NAME);
        let stdout = tokio::fs::read(replay_dir.join(STDOUT_REPLAY_NAME)).await.ok();
        let stderr = tokio::fs::read(replay_dir.join(STDERR_REPLAY_NAME)).await.ok();
        Ok(ReplayLogs { stdout, stderr })
    }
}

/// Filesystem layout: `<packageDir>/.wireit/<hex(name)>/cache/<fingerprint_hash>/`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCacheBackend;

impl LocalCacheBackend {
    fn cache_dir_for(&self, reference: &ScriptReference, fingerprint_hash: &str) -> AbsDirPath {
        let state_dir = crate::path::script_state_dir(&reference.package_dir, &reference.name);
        state_dir.join_str_dir("cache").join_str_dir(fingerprint_hash)
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalCacheBackend {
    async fn get(&self, reference: &ScriptReference, fingerprint_hash: &str) -> Result<Option<CacheHit>, CacheError> {
        let cache_dir = self.cache_dir_for(reference, fingerprint_hash);
        match tokio::fs::metadata(cache_dir.as_std_path()).await {
            Ok(_) => Ok(Some(CacheHit { cache_dir })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn set(
        &self,
        reference: &ScriptReference,
        fingerprint_hash: &str,
        package_dir: &AbsDirPath,
        paths: &[RelSomePath],
        replay: Option<&ReplayLogs>,
    ) -> Result<CacheHit, CacheError> {
        let cache_dir = self.cache_dir_for(reference, fingerprint_hash);
        if tokio::fs::metadata(cache_dir.as_std_path()).await.is_ok() {
            return Err(CacheError::AlreadyExists {
                reference: reference.canonical_string(),
                hash: fingerprint_hash.to_string(),
            });
        }
        fs::create_dir_all(&cache_dir).await.map_err(io_err)?;

        for rel in paths {
            let src = package_dir.as_std_path().join(rel.as_std_path());
            let dst = cache_dir.as_std_path().join(rel.as_std_path());
            copy_path(&src, &dst).await.map_err(io_err)?;
        }

        if let Some(replay) = replay {
            write_replay_logs(&cache_dir, replay).await.map_err(io_err)?;
        }

        Ok(CacheHit { cache_dir })
    }
}

async fn write_replay_logs(cache_dir: &AbsDirPath, replay: &ReplayLogs) -> std::io::Result<()> {
    let has_stdout = replay.stdout.as_ref().is_some_and(|b| !b.is_empty());
    let has_stderr = replay.stderr.as_ref().is_some_and(|b| !b.is_empty());
    if !has_stdout && !has_stderr {
        return Ok(());
    }
    let replay_dir = cache_dir.as_std_path().join(REPLAY_DIR_NAME);
    tokio::fs::create_dir_all(&replay_dir).await?;
    if has_stdout {
        tokio::fs::write(replay_dir.join(STDOUT_REPLAY_NAME), replay.stdout.as_ref().unwrap()).await?;
    }
    if has_stderr {
        tokio::fs::write(replay_dir.join(STDERR_REPLAY_NAME), replay.stderr.as_ref().unwrap()).await?;
    }
    Ok(())
}

/// Copy a single path (file, directory, or symlink) from `src` to `dst`,
/// creating `dst`'s parent directories as needed. Directories are copied
/// recursively via [`fs::copy_dir`], which preserves symlinks and empty
/// subdirectories.
async fn copy_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(src).await?;
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if meta.file_type().is_symlink() {
        let target = tokio::fs::read_link(src).await?;
        symlink(&target, dst).await
    } else if meta.is_dir() {
        let src_typed = AbsDirPath::try_from(src.to_path_buf()).expect("cache/package roots are absolute");
        let dst_typed = AbsDirPath::try_from(dst.to_path_buf()).expect("cache/package roots are absolute");
        tokio::fs::create_dir_all(dst).await?;
        fs::copy_dir(&src_typed, &dst_typed)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(())
    } else {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        tokio::fs::symlink_dir(target, link).await
    } else {
        tokio::fs::symlink_file(target, link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(dir: &std::path::Path) -> ScriptReference {
        ScriptReference {
            package_dir: AbsDirPath::try_from(dir.to_path_buf()).unwrap(),
            name: "build".to_string(),
        }
    }

    #[tokio::test]
    async fn miss_then_set_then_hit() {
        let pkg = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(pkg.path().join("lib")).await.unwrap();
        tokio::fs::write(pkg.path().join("lib/out.js"), b"console.log(1)").await.unwrap();

        let package_dir = AbsDirPath::try_from(pkg.path().to_path_buf()).unwrap();
        let reference = reference(pkg.path());
        let backend = LocalCacheBackend;

        let miss = backend.get(&reference, "deadbeef").await.unwrap();
        assert!(miss.is_none());

        let rel = RelSomePath::try_from(std::path::PathBuf::from("lib")).unwrap();
        let replay = ReplayLogs {
            stdout: Some(b"building...".to_vec()),
            stderr: None,
        };
        backend
            .set(&reference, "deadbeef", &package_dir, &[rel], Some(&replay))
            .await
            .unwrap();

        let hit = backend.get(&reference, "deadbeef").await.unwrap().expect("cache hit");

        let restore_dir = tempfile::tempdir().unwrap();
        let restore_path = AbsDirPath::try_from(restore_dir.path().to_path_buf()).unwrap();
        let replayed = hit.apply(&restore_path).await.unwrap();

        let content = tokio::fs::read_to_string(restore_dir.path().join("lib/out.js")).await.unwrap();
        assert_eq!(content, "console.log(1)");
        assert_eq!(replayed.stdout.as_deref(), Some(b"building..." as &[u8]));
        assert!(replayed.stderr.is_none());
    }

    #[tokio::test]
    async fn set_twice_is_rejected() {
        let pkg = tempfile::tempdir().unwrap();
        tokio::fs::write(pkg.path().join("out.txt"), b"x").await.unwrap();
        let package_dir = AbsDirPath::try_from(pkg.path().to_path_buf()).unwrap();
        let reference = reference(pkg.path());
        let backend = LocalCacheBackend;

        let rel = RelSomePath::try_from(std::path::PathBuf::from("out.txt")).unwrap();
        backend.set(&reference, "abc123", &package_dir, &[rel.clone()], None).await.unwrap();
        let err = backend.set(&reference, "abc123", &package_dir, &[rel], None).await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists { .. }));
    }
}
