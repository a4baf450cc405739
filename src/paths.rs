//! Containment of client-supplied paths under the served root.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RootError {
    #[error("failed to resolve root directory '{path}': {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("root path '{0}' is not a directory")]
    NotADirectory(PathBuf),
}

/// Deliberately carries no detail about the offending path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Invalid path")]
    OutsideRoot,
}

/// The single directory this server exposes. Established once at startup and
/// never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Root(PathBuf);

impl Root {
    /// Canonicalizes `path` and checks that it names a directory.
    pub fn establish(path: &Path) -> Result<Self, RootError> {
        let canonical = std::fs::canonicalize(path).map_err(|source| RootError::Canonicalize {
            path: path.to_path_buf(),
            source,
        })?;
        if !canonical.is_dir() {
            return Err(RootError::NotADirectory(canonical));
        }
        Ok(Root(canonical))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == self.0
    }

    /// Joins `request` onto the root and lexically cleans the result.
    ///
    /// Nothing on disk is consulted: `.` segments, repeated separators and a
    /// leading `/` are dropped, and each `..` removes the previous segment of
    /// the joined path (stopping at the filesystem root). The cleaned path is
    /// accepted only if it is the root or lies below it, so `../data/x`
    /// under `/data` resolves while `../etc` does not.
    pub fn resolve(&self, request: &str) -> Result<PathBuf, ResolveError> {
        let mut resolved = self.0.clone();
        for component in Path::new(request).components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir | Component::RootDir => {}
                // Drive and UNC prefixes can never name something below the root.
                Component::Prefix(_) => return Err(ResolveError::OutsideRoot),
            }
        }

        if !resolved.starts_with(&self.0) {
            return Err(ResolveError::OutsideRoot);
        }
        Ok(resolved)
    }
}
