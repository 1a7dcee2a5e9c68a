//! In-memory [`Backend`] used by the dispatcher and chain tests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::anyhow;

use super::{Backend, BackendError, Repository};
use crate::auth::{AccessLevel, ClientKey};
use crate::repo::RepoName;

#[derive(Debug)]
pub struct MemoryBackend {
    pub root: PathBuf,
    /// Level returned for any session that presented a key.
    pub key_level: AccessLevel,
    /// Level returned for keyless sessions.
    pub anon_level: AccessLevel,
    pub keyless: bool,
    pub fail_create: bool,
    repos: Mutex<HashSet<String>>,
    creations: AtomicUsize,
    queries: Mutex<Vec<(String, Option<ClientKey>)>>,
}

impl MemoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_level: AccessLevel::ReadWrite,
            anon_level: AccessLevel::ReadOnly,
            keyless: true,
            fail_create: false,
            repos: Mutex::new(HashSet::new()),
            creations: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_repo(self, name: &str) -> Self {
        self.repos.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn has_repo(&self, name: &str) -> bool {
        self.repos.lock().unwrap().contains(name)
    }

    /// Number of repositories actually created through the backend.
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Every `(repo, key)` pair the policy was asked about, in order.
    pub fn queries(&self) -> Vec<(String, Option<ClientKey>)> {
        self.queries.lock().unwrap().clone()
    }

    fn handle(&self, name: &RepoName) -> Repository {
        Repository {
            name: name.clone(),
            path: self.root.join(name.dir_name()),
            private: false,
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    fn access_level(&self, repo: &RepoName, key: Option<&ClientKey>) -> AccessLevel {
        self.queries
            .lock()
            .unwrap()
            .push((repo.as_str().to_string(), key.cloned()));
        match key {
            Some(_) => self.key_level,
            None => self.anon_level,
        }
    }

    fn allow_keyless(&self) -> bool {
        self.keyless
    }

    async fn repository(&self, name: &RepoName) -> Result<Repository, BackendError> {
        if self.has_repo(name.as_str()) {
            Ok(self.handle(name))
        } else {
            Err(BackendError::NotFound)
        }
    }

    async fn create_repository(&self, name: &RepoName, _private: bool) -> Result<Repository, BackendError> {
        // Give a concurrent creator the chance to interleave.
        tokio::task::yield_now().await;
        if self.fail_create {
            return Err(anyhow!("disk full").into());
        }
        let inserted = self.repos.lock().unwrap().insert(name.as_str().to_string());
        if !inserted {
            return Err(BackendError::AlreadyExists);
        }
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle(name))
    }

    async fn list_repositories(&self) -> Result<Vec<RepoName>, BackendError> {
        let mut names: Vec<RepoName> = self
            .repos
            .lock()
            .unwrap()
            .iter()
            .map(|n| RepoName::sanitize(n))
            .collect();
        names.sort();
        Ok(names)
    }
}
