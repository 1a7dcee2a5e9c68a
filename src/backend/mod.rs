//! Repository store and access-policy collaborator.
//!
//! Provides the [`Backend`] trait that the credential evaluator and the
//! protocol dispatcher call for every policy decision and every repository
//! lookup or creation.  Implementations own their own synchronisation: the
//! gateway calls them concurrently from independent session workers.

pub mod fs;

#[cfg(test)]
pub mod memory;

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::{AccessLevel, ClientKey};
use crate::repo::RepoName;

pub use fs::FsBackend;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Handle to a repository known to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: RepoName,
    pub path: PathBuf,
    pub private: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("repository not found")]
    NotFound,
    #[error("repository already exists")]
    AlreadyExists,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Access `key` (or the anonymous identity when `None`) holds on `repo`.
    /// An empty name asks for the connection-level access.
    fn access_level(&self, repo: &RepoName, key: Option<&ClientKey>) -> AccessLevel;

    /// Whether sessions without a public key are permitted at all.
    fn allow_keyless(&self) -> bool;

    async fn repository(&self, name: &RepoName) -> Result<Repository, BackendError>;

    /// Create a bare repository.  Must return [`BackendError::AlreadyExists`]
    /// (not corrupt the store) when `name` already exists, including when a
    /// concurrent caller created it first.
    async fn create_repository(&self, name: &RepoName, private: bool) -> Result<Repository, BackendError>;

    /// Names of every repository in the store.
    async fn list_repositories(&self) -> Result<Vec<RepoName>, BackendError>;
}
