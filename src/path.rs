//! Typed path newtypes.
//!
//! Plain `PathBuf`s don't distinguish "absolute path to a package directory"
//! from "relative glob pattern anchored at that directory" at the type level,
//! and it's easy to accidentally join two absolute paths or compare a
//! relative manifest path against an absolute one. `TypedPath<Base, Type>`
//! carries that distinction as phantom type parameters so the compiler
//! rejects the mix-up.
//!
//! Paths are stored exactly as given; this module does not normalize `.`/`..`
//! components or case. Normalize before constructing a `TypedPath` if you
//! need that.

use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    fmt,
    marker::PhantomData,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub type RelFilePath = TypedPath<Rel, File>;
pub type RelDirPath = TypedPath<Rel, Dir>;
pub type RelSomePath = TypedPath<Rel, SomeType>;
pub type AbsFilePath = TypedPath<Abs, File>;
pub type AbsDirPath = TypedPath<Abs, Dir>;
pub type AbsSomePath = TypedPath<Abs, SomeType>;

/// An absolute path, anchored at the filesystem root.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Abs;

/// A relative path, anchored at some base the caller is expected to supply.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rel;

/// A directory.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Dir;

/// A file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct File;

/// Either a file or a directory; used for paths whose kind isn't known yet
/// (e.g. a glob pattern before it's matched against the filesystem).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SomeType;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not absolute: {0:?}")]
    NotAbsolute(PathBuf),
    #[error("path is not relative: {0:?}")]
    NotRelative(PathBuf),
    #[error("{0:?} is not relative to {1:?}")]
    NotRelativeTo(PathBuf, PathBuf),
}

/// A path carrying its base (absolute/relative) and kind (file/dir) as
/// phantom type parameters. See the module docs for rationale.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.inner.display())]
pub struct TypedPath<Base, Kind> {
    base: PhantomData<Base>,
    kind: PhantomData<Kind>,
    inner: PathBuf,
}

impl<B, K> TypedPath<B, K> {
    fn new_unchecked(inner: impl Into<PathBuf>) -> Self {
        Self {
            base: PhantomData,
            kind: PhantomData,
            inner: inner.into(),
        }
    }

    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }

    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        self.inner.to_string_lossy()
    }

    pub fn as_os_str(&self) -> &OsStr {
        self.inner.as_os_str()
    }

    pub fn components(&self) -> impl DoubleEndedIterator<Item = Component<'_>> {
        self.inner.components()
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.inner.file_name()
    }

    /// The parent of this path, or `None` for a relative path with a single
    /// component (unlike `std::path::Path::parent`, which returns `Some("")`).
    pub fn parent(&self) -> Option<TypedPath<B, Dir>> {
        self.inner
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| TypedPath::new_unchecked(p.to_owned()))
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.inner
    }
}

impl<B, K> fmt::Debug for TypedPath<B, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl<B, K> AsRef<Path> for TypedPath<B, K> {
    fn as_ref(&self) -> &Path {
        &self.inner
    }
}

impl<B, K> From<TypedPath<B, K>> for PathBuf {
    fn from(value: TypedPath<B, K>) -> Self {
        value.inner
    }
}

impl TryFrom<PathBuf> for TypedPath<Abs, Dir> {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        if !value.is_absolute() {
            return Err(PathError::NotAbsolute(value));
        }
        Ok(Self::new_unchecked(value))
    }
}

impl TryFrom<PathBuf> for TypedPath<Abs, File> {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        if !value.is_absolute() {
            return Err(PathError::NotAbsolute(value));
        }
        Ok(Self::new_unchecked(value))
    }
}

impl TryFrom<PathBuf> for TypedPath<Abs, SomeType> {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        if !value.is_absolute() {
            return Err(PathError::NotAbsolute(value));
        }
        Ok(Self::new_unchecked(value))
    }
}

impl TryFrom<PathBuf> for TypedPath<Rel, File> {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        if value.is_absolute() {
            return Err(PathError::NotRelative(value));
        }
        Ok(Self::new_unchecked(value))
    }
}

impl TryFrom<PathBuf> for TypedPath<Rel, Dir> {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        if value.is_absolute() {
            return Err(PathError::NotRelative(value));
        }
        Ok(Self::new_unchecked(value))
    }
}

impl TryFrom<PathBuf> for TypedPath<Rel, SomeType> {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        if value.is_absolute() {
            return Err(PathError::NotRelative(value));
        }
        Ok(Self::new_unchecked(value))
    }
}

impl<B: 'static, K: 'static> TryFrom<&str> for TypedPath<B, K>
where
    TypedPath<B, K>: TryFrom<PathBuf, Error = PathError>,
{
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        TypedPath::try_from(PathBuf::from(value))
    }
}

impl<B: 'static, K: 'static> FromStr for TypedPath<B, K>
where
    TypedPath<B, K>: TryFrom<PathBuf, Error = PathError>,
{
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypedPath::try_from(PathBuf::from(s))
    }
}

impl TypedPath<Abs, Dir> {
    pub fn current() -> std::io::Result<Self> {
        std::env::current_dir().map(Self::new_unchecked)
    }

    /// Join a relative directory path, producing an absolute one.
    pub fn join_dir(&self, rel: &TypedPath<Rel, Dir>) -> TypedPath<Abs, Dir> {
        TypedPath::new_unchecked(self.inner.join(&rel.inner))
    }

    /// Join a relative file path, producing an absolute one.
    pub fn join_file(&self, rel: &TypedPath<Rel, File>) -> TypedPath<Abs, File> {
        TypedPath::new_unchecked(self.inner.join(&rel.inner))
    }

    /// Join a path segment given as a plain string; does not validate the
    /// segment beyond what `PathBuf::join` already does.
    pub fn join_str_dir(&self, name: impl AsRef<str>) -> TypedPath<Abs, Dir> {
        TypedPath::new_unchecked(self.inner.join(name.as_ref()))
    }

    pub fn join_str_file(&self, name: impl AsRef<str>) -> TypedPath<Abs, File> {
        TypedPath::new_unchecked(self.inner.join(name.as_ref()))
    }
}

impl<K> TypedPath<Abs, K> {
    /// Strip `base` from `self`, producing a path relative to it.
    pub fn relative_to(&self, base: &TypedPath<Abs, Dir>) -> Result<TypedPath<Rel, K>, PathError> {
        self.inner
            .strip_prefix(&base.inner)
            .map(|p| TypedPath::new_unchecked(p.to_owned()))
            .map_err(|_| PathError::NotRelativeTo(self.inner.clone(), base.inner.clone()))
    }
}

impl<'de, B: 'static, K: 'static> Deserialize<'de> for TypedPath<B, K>
where
    TypedPath<B, K>: TryFrom<PathBuf, Error = PathError>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let p = PathBuf::deserialize(deserializer)?;
        TypedPath::try_from(p).map_err(serde::de::Error::custom)
    }
}

impl<B, K> Serialize for TypedPath<B, K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.inner.serialize(serializer)
    }
}

/// Hex-encode a script name so it's safe to use as a path component on every
/// platform (script names may contain `/`, `:`, or other characters that
/// aren't valid in a single path segment).
pub fn hex_encode_name(name: &str) -> String {
    hex::encode(name.as_bytes())
}

/// Build the absolute `.wireit/<hex(name)>` state directory for a script.
pub fn script_state_dir(package_dir: &AbsDirPath, script_name: &str) -> AbsDirPath {
    package_dir
        .join_str_dir(".wireit")
        .join_str_dir(hex_encode_name(script_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_rejects_relative() {
        assert!(AbsDirPath::try_from(PathBuf::from("relative/path")).is_err());
    }

    #[test]
    fn rel_rejects_absolute() {
        assert!(RelDirPath::try_from(PathBuf::from("/absolute/path")).is_err());
    }

    #[test]
    fn relative_to_strips_prefix() {
        let base = AbsDirPath::try_from(PathBuf::from("/a/b")).unwrap();
        let child = AbsFilePath::try_from(PathBuf::from("/a/b/c/d.txt")).unwrap();
        let rel = child.relative_to(&base).unwrap();
        assert_eq!(rel.as_std_path(), Path::new("c/d.txt"));
    }

    #[test]
    fn relative_to_fails_when_not_prefixed() {
        let base = AbsDirPath::try_from(PathBuf::from("/a/b")).unwrap();
        let other = AbsFilePath::try_from(PathBuf::from("/x/y.txt")).unwrap();
        assert!(other.relative_to(&base).is_err());
    }

    #[test]
    fn hex_encode_name_is_stable() {
        assert_eq!(hex_encode_name("build"), hex::encode("build"));
        assert_ne!(hex_encode_name("build"), hex_encode_name("test"));
    }

    #[test]
    fn parent_of_single_component_relative_is_none() {
        let p = RelFilePath::try_from(PathBuf::from("file.txt")).unwrap();
        assert!(p.parent().is_none());
    }
}

// Used by `hex_encode_name`.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        ::hex::encode(bytes.as_ref())
    }
}
