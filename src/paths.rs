//! Container-to-host path translation.
//!
//! The executor contract names every file from the container's perspective,
//! rooted at the declared input/output roots (`/in` and `/out` by default).
//! `PathTranslator` maps those paths onto the host workspace and back. It is
//! pure prefix substitution: no filesystem access, no normalization beyond
//! component matching.

use std::path::{Path, PathBuf};

use crate::error::PathError;

/// Bidirectional mapping between container-side and host-side paths.
///
/// Holds the two declared root mappings
/// `(container_in_root -> host_in_dir, container_out_root -> host_out_dir)`.
/// Translation picks the nearest enclosing root and substitutes the prefix;
/// a path under neither root is rejected with [`PathError::OutOfBounds`].
#[derive(Debug, Clone)]
pub struct PathTranslator {
    container_in_root: PathBuf,
    container_out_root: PathBuf,
    host_in_dir: PathBuf,
    host_out_dir: PathBuf,
}

impl PathTranslator {
    /// Creates a translator over the given root pairs.
    pub fn new(
        container_in_root: impl Into<PathBuf>,
        host_in_dir: impl Into<PathBuf>,
        container_out_root: impl Into<PathBuf>,
        host_out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            container_in_root: container_in_root.into(),
            container_out_root: container_out_root.into(),
            host_in_dir: host_in_dir.into(),
            host_out_dir: host_out_dir.into(),
        }
    }

    /// Translates a container-side path to the corresponding host path.
    ///
    /// The output root is matched first, then the input root. The path must
    /// be a strict descendant of one of them.
    pub fn to_host(&self, container_path: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let path = container_path.as_ref();

        if let Some(rel) = strict_descendant(path, &self.container_out_root) {
            return Ok(self.host_out_dir.join(rel));
        }
        if let Some(rel) = strict_descendant(path, &self.container_in_root) {
            return Ok(self.host_in_dir.join(rel));
        }

        Err(self.out_of_bounds(path))
    }

    /// Translates a host-side path back to the container path it maps from.
    ///
    /// Exact inverse of [`to_host`](Self::to_host): for any path `p` under a
    /// declared container root, `to_container(to_host(p)) == p`.
    pub fn to_container(&self, host_path: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let path = host_path.as_ref();

        if let Some(rel) = strict_descendant(path, &self.host_out_dir) {
            return Ok(self.container_out_root.join(rel));
        }
        if let Some(rel) = strict_descendant(path, &self.host_in_dir) {
            return Ok(self.container_in_root.join(rel));
        }

        Err(self.out_of_bounds(path))
    }

    /// The declared container-side input root.
    pub fn container_in_root(&self) -> &Path {
        &self.container_in_root
    }

    /// The declared container-side output root.
    pub fn container_out_root(&self) -> &Path {
        &self.container_out_root
    }

    /// The host directory backing the input root.
    pub fn host_in_dir(&self) -> &Path {
        &self.host_in_dir
    }

    /// The host directory backing the output root.
    pub fn host_out_dir(&self) -> &Path {
        &self.host_out_dir
    }

    fn out_of_bounds(&self, path: &Path) -> PathError {
        PathError::OutOfBounds {
            path: path.to_path_buf(),
            in_root: self.container_in_root.clone(),
            out_root: self.container_out_root.clone(),
        }
    }
}

/// Returns the relative part of `path` under `root` when `path` is a strict
/// descendant of `root` (equality does not count).
fn strict_descendant<'a>(path: &'a Path, root: &Path) -> Option<&'a Path> {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => Some(rel),
        _ => None,
    }
}
