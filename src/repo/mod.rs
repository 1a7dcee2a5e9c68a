//! Repository naming and on-disk path confinement.

pub mod confine;
pub mod name;

pub use confine::{ensure_within, repo_path, PathEscape, RepoPath};
pub use name::RepoName;
