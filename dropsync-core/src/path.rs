//! Store-relative paths and the normaliser that produces them from local paths.

use crate::error::ValidationError;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A validated, `/`-separated path relative to the sync root.
///
/// Never empty, never absolute, and free of `.`/`..` and empty segments, so two
/// `RelPath`s name the same entry exactly when their strings are equal.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(String);

impl RelPath {
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        if s.is_empty() {
            return Err(ValidationError::Empty);
        }
        if s.starts_with('/') {
            return Err(ValidationError::Absolute(s));
        }
        if s.contains('\\') {
            return Err(ValidationError::Backslash(s));
        }
        for seg in s.split('/') {
            match seg {
                "" => return Err(ValidationError::EmptySegment(s)),
                "." | ".." => return Err(ValidationError::RelativeComponent(s)),
                _ => {}
            }
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parent(&self) -> Option<RelPath> {
        self.0.rsplit_once('/').map(|(p, _)| RelPath(p.to_string()))
    }

    /// Proper ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = RelPath> + '_ {
        self.0
            .char_indices()
            .rev()
            .filter(|(_, c)| *c == '/')
            .map(move |(i, _)| RelPath(self.0[..i].to_string()))
    }

    /// Appends a single validated segment (or a relative sub-path).
    pub fn join(&self, child: &str) -> Result<RelPath, ValidationError> {
        RelPath::new(format!("{}/{}", self.0, child))
    }

    /// True when `self` is a proper ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &RelPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Same path, ancestor or descendant: operations on overlapping paths must keep their order.
    pub fn overlaps(&self, other: &RelPath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Re-roots `self` from under `from` to under `to`. `None` when `self` is not within `from`.
    pub fn rebase(&self, from: &RelPath, to: &RelPath) -> Option<RelPath> {
        if self == from {
            return Some(to.clone());
        }
        if from.is_ancestor_of(self) {
            return Some(RelPath(format!("{}{}", to.0, &self.0[from.0.len()..])));
        }
        None
    }

    /// Absolute local location of this path under `root`.
    pub fn to_local(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for RelPath {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        RelPath::new(value)
    }
}

/// Turns absolute local paths into [`RelPath`]s under a fixed root.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    root: PathBuf,
    // watchers may report the canonical form of the root (symlinked temp dirs, ...)
    canonical: Option<PathBuf>,
}

impl PathNormalizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let canonical = std::fs::canonicalize(&root).ok().filter(|c| *c != root);
        Self { root, canonical }
    }

    pub fn normalize(&self, path: &Path) -> Result<RelPath, ValidationError> {
        let rel = path
            .strip_prefix(&self.root)
            .ok()
            .or_else(|| {
                self.canonical
                    .as_deref()
                    .and_then(|c| path.strip_prefix(c).ok())
            })
            .ok_or_else(|| ValidationError::OutsideRoot(path.to_path_buf()))?;

        let mut segments = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(seg) => {
                    let seg = seg
                        .to_str()
                        .ok_or_else(|| ValidationError::NonUtf8(path.to_path_buf()))?;
                    segments.push(seg);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(ValidationError::RelativeComponent(
                        rel.to_string_lossy().into_owned(),
                    ))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ValidationError::OutsideRoot(path.to_path_buf()))
                }
            }
        }
        RelPath::new(segments.join("/"))
    }

    /// Local location of a store-relative path.
    pub fn to_local(&self, rel: &RelPath) -> PathBuf {
        rel.to_local(&self.root)
    }
}
