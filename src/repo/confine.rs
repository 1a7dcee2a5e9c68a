//! Confinement of repository paths to the repository root.
//!
//! Sanitization in [`RepoName`] already removes most traversal tokens; this
//! check is the backstop that runs before any filesystem or subprocess call
//! sees a path.  The analysis is purely lexical and never touches the disk.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use super::name::RepoName;

/// The candidate path resolved outside of (or exactly onto) the root.
#[derive(Debug, Error)]
#[error("path {candidate:?} escapes repository root {root:?}")]
pub struct PathEscape {
    pub root: PathBuf,
    pub candidate: PathBuf,
}

/// A path proven to be a strict descendant of the repository root.
///
/// Only [`ensure_within`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath(PathBuf);

impl RepoPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for RepoPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Resolve `candidate` against `root` and verify the result stays strictly
/// below it.
pub fn ensure_within(root: &Path, candidate: impl AsRef<Path>) -> Result<RepoPath, PathEscape> {
    let candidate = candidate.as_ref();
    let escape = || PathEscape {
        root: root.to_path_buf(),
        candidate: candidate.to_path_buf(),
    };

    let rooted = candidate
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)));
    if rooted {
        warn!(candidate = %candidate.display(), "rejected absolute repository path");
        return Err(escape());
    }

    let root = normalize(root);
    let resolved = normalize(&root.join(candidate));

    if resolved == root || !resolved.starts_with(&root) {
        warn!(
            root = %root.display(),
            candidate = %candidate.display(),
            "rejected repository path outside of the repository root"
        );
        return Err(escape());
    }

    Ok(RepoPath(resolved))
}

/// `join(root, name + ".git")`, confined to `root`.
pub fn repo_path(root: &Path, name: &RepoName) -> Result<RepoPath, PathEscape> {
    ensure_within(root, name.dir_name())
}

/// Lexically resolve `.` and `..` components.
///
/// A `..` that would climb above the start of a relative path is kept, so a
/// relative root and an escaping join never compare as nested.
fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}
