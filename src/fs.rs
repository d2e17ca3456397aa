//! Filesystem operations used by the rest of the crate.
//!
//! Everything here goes through `tokio::fs` so callers never block the async
//! runtime on disk IO. Paths are typed ([`crate::path`]) so a caller can't
//! accidentally pass a relative glob pattern where an absolute package
//! directory is expected.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use derive_more::Display;
use fslock::LockFile as FsLockFile;
use tap::{Pipe, TapFallible};
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace};

use crate::path::{Abs, AbsDirPath, AbsFilePath, TypedPath};

/// Default concurrency for recursive directory copies.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// A cross-process advisory lock file, typestated so a caller can't lock an
/// already-locked handle or unlock an already-unlocked one.
#[derive(Clone, Display)]
#[display("{path}")]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: AbsFilePath,
    inner: Arc<Mutex<FsLockFile>>,
}

impl<S> std::fmt::Debug for LockFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile").field("path", &self.path).finish()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    pub async fn open(path: AbsFilePath) -> Result<Self> {
        if let Some(parent) = path.parent() {
            create_dir_all(&parent).await?;
        }
        let (file, path) = spawn_blocking({
            let path = path.clone();
            move || FsLockFile::open(path.as_std_path()).map(|file| (file, path))
        })
        .await
        .context("join task")?
        .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Acquire the lock, blocking until it's available.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            self.inner.blocking_lock().lock().context("lock file")?;
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }

    /// Attempt to acquire the lock without blocking; `Ok(None)` means it's
    /// currently held by someone else.
    pub async fn try_lock(self) -> Result<Result<LockFile<Locked>, LockFile<Unlocked>>> {
        spawn_blocking(move || -> Result<_> {
            let acquired = self.inner.blocking_lock().try_lock().context("try lock file")?;
            Ok(if acquired {
                Ok(LockFile {
                    state: PhantomData,
                    inner: self.inner,
                    path: self.path,
                })
            } else {
                Err(LockFile {
                    state: PhantomData,
                    inner: self.inner,
                    path: self.path,
                })
            })
        })
        .await
        .context("join task")?
    }
}

impl LockFile<Locked> {
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || {
            self.inner.blocking_lock().unlock().context("unlock file")?;
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }

    /// Update the lock file's mtime so other processes polling for staleness
    /// see this lock is still held by a live process.
    pub async fn refresh(&self) -> Result<()> {
        let path = self.path.clone();
        spawn_blocking(move || {
            let now = filetime::FileTime::now();
            filetime::set_file_mtime(path.as_std_path(), now).context("refresh lock mtime")
        })
        .await
        .context("join task")?
    }

    pub fn path(&self) -> &AbsFilePath {
        &self.path
    }
}

/// Spawn a background task that periodically refreshes `lock`'s mtime until
/// dropped. Used by the executor to keep a held lock from looking stale to
/// other processes polling it (spec: 2s refresh interval, 10s staleness).
pub fn spawn_refresh_task(lock: Arc<LockFile<Locked>>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if lock.refresh().await.is_err() {
                break;
            }
        }
    })
}

/// The default cache directory for the current user, following platform
/// conventions (XDG on Linux, `Library/Caches` on macOS, `%LOCALAPPDATA%` on
/// Windows), falling back to `$HOME/.cache/packrun` if the platform-specific
/// directories crate can't resolve one.
#[instrument]
pub async fn user_global_cache_path() -> Result<AbsDirPath> {
    let dirs = spawn_blocking(|| directories::ProjectDirs::from("", "", "packrun"))
        .await
        .expect("join task");

    let base = if let Some(dirs) = dirs {
        dirs.cache_dir().to_path_buf()
    } else {
        homedir::my_home()
            .context("get user home directory")?
            .ok_or_eyre("user has no home directory")?
            .join(".cache")
            .join("packrun")
    };

    base.pipe(AbsDirPath::try_from)
        .map_err(|e| color_eyre::eyre::eyre!(e))
        .tap_ok(|dir| trace!(?dir, "user global cache path"))
}

#[instrument]
pub async fn create_dir_all(dir: &AbsDirPath) -> Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create dir: {dir:?}"))
}

/// Remove a directory tree if it exists; a missing directory is not an error.
#[instrument]
pub async fn remove_dir_all(dir: &AbsDirPath) -> Result<()> {
    match tokio::fs::remove_dir_all(dir.as_std_path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove dir: {dir:?}")),
    }
}

/// Recursively, symlink-preservingly copy `src` to `dst`. Returns the number
/// of entries copied (files + symlinks).
#[instrument]
pub async fn copy_dir(src: &AbsDirPath, dst: &AbsDirPath) -> Result<u64> {
    copy_dir_with_concurrency(DEFAULT_CONCURRENCY, src, dst).await
}

#[instrument]
pub async fn copy_dir_with_concurrency(concurrency: usize, src: &AbsDirPath, dst: &AbsDirPath) -> Result<u64> {
    use futures::{StreamExt, TryStreamExt};

    let src = src.clone();
    let dst = dst.clone();
    let entries = spawn_blocking(move || -> Result<Vec<walkdir::DirEntry>> {
        walkdir::WalkDir::new(src.as_std_path())
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("walk source tree")
    })
    .await
    .context("join task")??;

    let count = futures::stream::iter(entries)
        .map(|entry| {
            let src = src.clone();
            let dst = dst.clone();
            async move { copy_entry(&src, &dst, &entry).await }
        })
        .buffer_unordered(concurrency)
        .try_fold(0u64, |total, copied| async move { Ok(total + u64::from(copied)) })
        .await?;

    Ok(count)
}

async fn copy_entry(src_root: &AbsDirPath, dst_root: &AbsDirPath, entry: &walkdir::DirEntry) -> Result<bool> {
    let rel = entry
        .path()
        .strip_prefix(src_root.as_std_path())
        .expect("walkdir entries are under src_root");
    if rel.as_os_str().is_empty() {
        return Ok(false);
    }
    let dst_path = dst_root.as_std_path().join(rel);

    let file_type = entry.file_type();
    if file_type.is_dir() {
        tokio::fs::create_dir_all(&dst_path)
            .await
            .with_context(|| format!("create dir: {dst_path:?}"))?;
        return Ok(false);
    }

    if let Some(parent) = dst_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent dir: {parent:?}"))?;
    }

    if file_type.is_symlink() {
        let target = tokio::fs::read_link(entry.path())
            .await
            .with_context(|| format!("read symlink: {:?}", entry.path()))?;
        symlink(&target, &dst_path)
            .await
            .with_context(|| format!("create symlink: {dst_path:?} -> {target:?}"))?;
        return Ok(true);
    }

    tokio::fs::copy(entry.path(), &dst_path)
        .await
        .with_context(|| format!("copy file: {:?} -> {dst_path:?}", entry.path()))?;
    Ok(true)
}

#[cfg(unix)]
async fn symlink(target: &std::path::Path, link: &std::path::Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &std::path::Path, link: &std::path::Path) -> std::io::Result<()> {
    if target.is_dir() {
        tokio::fs::symlink_dir(target, link).await
    } else {
        tokio::fs::symlink_file(target, link).await
    }
}

/// `true` if the directory exists and contains no regular files (nested empty
/// directories don't count as content either).
#[instrument]
pub async fn is_dir_empty(path: &AbsDirPath) -> Result<bool> {
    let path = path.clone();
    spawn_blocking(move || -> Result<bool> {
        for entry in walkdir::WalkDir::new(path.as_std_path()) {
            let entry = entry.context("walk directory")?;
            if entry.file_type().is_file() {
                return Ok(false);
            }
        }
        Ok(true)
    })
    .await
    .context("join task")?
}

#[instrument]
pub async fn read_to_string(path: &AbsFilePath) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path.as_std_path()).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read file: {path:?}")),
    }
}

#[instrument(skip(content))]
pub async fn write(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(&parent).await?;
    }
    tokio::fs::write(path.as_std_path(), content.as_ref())
        .await
        .with_context(|| format!("write file: {path:?}"))
}

/// Write via a sibling temp file then rename, so readers never observe a
/// torn write (spec §5: "write-then-rename, or single writer per file").
#[instrument(skip(content))]
pub async fn write_atomic(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(&parent).await?;
    }
    let tmp_name = format!("{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("out"));
    let tmp_path = path
        .parent()
        .map(|p| p.as_std_path().join(&tmp_name))
        .unwrap_or_else(|| std::path::PathBuf::from(&tmp_name));
    tokio::fs::write(&tmp_path, content.as_ref())
        .await
        .with_context(|| format!("write temp file: {tmp_path:?}"))?;
    tokio::fs::rename(&tmp_path, path.as_std_path())
        .await
        .with_context(|| format!("rename {tmp_path:?} -> {path:?}"))
}

/// Create every leaf directory in `dirs` (and their parents) while reusing
/// shared ancestors, so a declared `output` of `["dist/a", "dist/b"]` only
/// creates `dist` once.
pub async fn mkdir_minimized(base: &AbsDirPath, dirs: impl IntoIterator<Item = TypedPath<Abs, crate::path::Dir>>) -> Result<()> {
    let mut created = std::collections::HashSet::new();
    for dir in dirs {
        let mut to_create = Vec::new();
        let mut cur = Some(dir);
        while let Some(d) = cur {
            if d.as_std_path() == base.as_std_path() || !created.insert(d.clone()) {
                break;
            }
            to_create.push(d.clone());
            cur = d.parent();
        }
        for d in to_create.into_iter().rev() {
            create_dir_all(&d).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("lock")).unwrap();
        let lock = LockFile::open(path).await.unwrap();
        let locked = lock.lock().await.unwrap();
        locked.refresh().await.unwrap();
        let _unlocked = locked.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn copy_dir_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(src.path().join("nested")).await.unwrap();
        tokio::fs::write(src.path().join("nested/a.txt"), b"hi").await.unwrap();

        let src_path = AbsDirPath::try_from(src.path().to_path_buf()).unwrap();
        let dst_path = AbsDirPath::try_from(dst.path().to_path_buf()).unwrap();
        let copied = copy_dir(&src_path, &dst_path).await.unwrap();

        assert_eq!(copied, 1);
        let content = tokio::fs::read_to_string(dst.path().join("nested/a.txt")).await.unwrap();
        assert_eq!(content, "hi");
    }

    #[tokio::test]
    async fn is_dir_empty_detects_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        assert!(is_dir_empty(&path).await.unwrap());

        tokio::fs::write(dir.path().join("a.txt"), b"x").await.unwrap();
        assert!(!is_dir_empty(&path).await.unwrap());
    }
}
