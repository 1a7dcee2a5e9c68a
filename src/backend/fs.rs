//! Filesystem repository store with a configuration-driven access policy.
//!
//! Repositories live as bare Git repositories under `{root}/{name}.git`.
//! Creation is serialised through an async lock so two sessions racing to
//! create the same name yield exactly one repository and one
//! [`BackendError::AlreadyExists`].
//!
//! The policy lookup is synchronous and runs on every authorization, so it
//! never touches the disk: private markers are read once at startup and
//! kept current by [`Backend::create_repository`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Context};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{Backend, BackendError, Repository};
use crate::auth::{AccessLevel, ClientKey};
use crate::config::{AccessConfig, RepoConfig};
use crate::git::bare_repo::{init_bare_repo, list_bare_repos, validate_bare_repo};
use crate::repo::{repo_path, RepoName};

/// Marker file recording that a repository was created private.
const PRIVATE_MARKER: &str = "forgegate-private";

#[derive(Debug)]
struct User {
    name: String,
    keys: Vec<ClientKey>,
    access: AccessLevel,
}

#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    anon_access: AccessLevel,
    allow_keyless: bool,
    admin_keys: Vec<ClientKey>,
    users: Vec<User>,
    repos: HashMap<String, RepoConfig>,
    /// Repositories created private at runtime (they carry the marker file).
    marked_private: RwLock<HashSet<String>>,
    create_lock: Mutex<()>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>, access: &AccessConfig) -> anyhow::Result<Self> {
        let admin_keys = access
            .admin_keys
            .iter()
            .map(|line| ClientKey::parse_authorized(line))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("invalid admin key")?;

        let users = access
            .users
            .iter()
            .map(|u| {
                let keys = u
                    .keys
                    .iter()
                    .map(|line| ClientKey::parse_authorized(line))
                    .collect::<anyhow::Result<Vec<_>>>()
                    .with_context(|| format!("invalid key for user {:?}", u.name))?;
                Ok(User {
                    name: u.name.clone(),
                    keys,
                    access: u.access,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let root = root.into();
        let marked_private = scan_private_markers(&root)?;
        if !marked_private.is_empty() {
            debug!(count = marked_private.len(), "loaded private repository markers");
        }

        Ok(Self {
            root,
            anon_access: access.anon_access,
            allow_keyless: access.allow_keyless,
            admin_keys,
            users,
            repos: access.repos.clone(),
            marked_private: RwLock::new(marked_private),
            create_lock: Mutex::new(()),
        })
    }

    fn user_by_key(&self, key: &ClientKey) -> Option<&User> {
        self.users.iter().find(|u| u.keys.contains(key))
    }

    /// Configured private, or created private at runtime.
    fn is_private(&self, name: &RepoName) -> bool {
        self.repos.get(name.as_str()).is_some_and(|r| r.private)
            || self
                .marked_private
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(name.as_str())
    }
}

/// Names of the bare repositories under `root` that carry the private marker.
fn scan_private_markers(root: &Path) -> anyhow::Result<HashSet<String>> {
    let mut marked = HashSet::new();
    for dir in list_bare_repos(root)? {
        let name = RepoName::sanitize(&dir);
        let Ok(path) = repo_path(root, &name) else {
            continue;
        };
        if path.as_path().join(PRIVATE_MARKER).is_file() {
            marked.insert(name.as_str().to_string());
        }
    }
    Ok(marked)
}

#[async_trait::async_trait]
impl Backend for FsBackend {
    fn access_level(&self, repo: &RepoName, key: Option<&ClientKey>) -> AccessLevel {
        if let Some(key) = key {
            if self.admin_keys.contains(key) {
                return AccessLevel::Admin;
            }
        }

        let user = key.and_then(|k| self.user_by_key(k));
        let base = match user {
            Some(u) => u.access.max(self.anon_access),
            None => self.anon_access,
        };
        if repo.is_empty() {
            return base;
        }

        if let Some(user) = user {
            let collaborator = self
                .repos
                .get(repo.as_str())
                .is_some_and(|r| r.collaborators.iter().any(|c| c == &user.name));
            if collaborator {
                return base.max(AccessLevel::ReadWrite);
            }
        }

        if self.is_private(repo) {
            return AccessLevel::NoAccess;
        }
        base
    }

    fn allow_keyless(&self) -> bool {
        self.allow_keyless
    }

    async fn repository(&self, name: &RepoName) -> Result<Repository, BackendError> {
        let path = repo_path(&self.root, name).map_err(|e| BackendError::Other(e.into()))?;
        if !validate_bare_repo(path.as_path()).await {
            return Err(BackendError::NotFound);
        }
        Ok(Repository {
            name: name.clone(),
            path: path.as_path().to_path_buf(),
            private: self.is_private(name),
        })
    }

    #[instrument(skip(self), fields(repo = %name))]
    async fn create_repository(&self, name: &RepoName, private: bool) -> Result<Repository, BackendError> {
        if name.is_empty() {
            return Err(anyhow!("refusing to create a repository with an empty name").into());
        }
        let path = repo_path(&self.root, name).map_err(|e| BackendError::Other(e.into()))?;

        let _guard = self.create_lock.lock().await;
        if validate_bare_repo(path.as_path()).await {
            debug!("repository already exists");
            return Err(BackendError::AlreadyExists);
        }

        init_bare_repo(path.as_path()).await?;
        if private {
            tokio::fs::write(path.as_path().join(PRIVATE_MARKER), b"")
                .await
                .context("failed to mark repository private")?;
            self.marked_private
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.as_str().to_string());
        }

        info!(private, "repository created");
        Ok(Repository {
            name: name.clone(),
            path: path.as_path().to_path_buf(),
            private,
        })
    }

    async fn list_repositories(&self) -> Result<Vec<RepoName>, BackendError> {
        let root = self.root.clone();
        let names = tokio::task::spawn_blocking(move || list_bare_repos(&root))
            .await
            .context("blocking task panicked")??;
        Ok(names.iter().map(|n| RepoName::sanitize(n)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::key::tests::{key, ALICE, BOB, ROOT};
    use crate::config::UserConfig;

    fn access_config() -> AccessConfig {
        let mut repos = HashMap::new();
        repos.insert(
            "secret".to_string(),
            RepoConfig {
                private: true,
                collaborators: vec!["alice".to_string()],
            },
        );
        AccessConfig {
            anon_access: AccessLevel::ReadOnly,
            allow_keyless: true,
            admin_keys: vec![ROOT.to_string()],
            users: vec![
                UserConfig {
                    name: "alice".to_string(),
                    keys: vec![ALICE.to_string()],
                    access: AccessLevel::ReadWrite,
                },
                UserConfig {
                    name: "bob".to_string(),
                    keys: vec![BOB.to_string()],
                    access: AccessLevel::ReadOnly,
                },
            ],
            repos,
        }
    }

    fn backend(root: &Path) -> FsBackend {
        FsBackend::new(root, &access_config()).unwrap()
    }

    fn name(s: &str) -> RepoName {
        RepoName::sanitize(s)
    }

    fn fake_bare_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    #[test]
    fn admin_key_is_admin_everywhere() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let root = key(ROOT);
        assert_eq!(b.access_level(&name(""), Some(&root)), AccessLevel::Admin);
        assert_eq!(b.access_level(&name("secret"), Some(&root)), AccessLevel::Admin);
    }

    #[test]
    fn anonymous_gets_anon_access_on_public_repos() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        assert_eq!(b.access_level(&name(""), None), AccessLevel::ReadOnly);
        assert_eq!(b.access_level(&name("public"), None), AccessLevel::ReadOnly);
    }

    #[test]
    fn known_users_get_their_configured_level() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        assert_eq!(b.access_level(&name("public"), Some(&key(ALICE))), AccessLevel::ReadWrite);
        assert_eq!(b.access_level(&name("public"), Some(&key(BOB))), AccessLevel::ReadOnly);
    }

    #[test]
    fn private_repos_admit_only_collaborators() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        assert_eq!(b.access_level(&name("secret"), Some(&key(ALICE))), AccessLevel::ReadWrite);
        assert_eq!(b.access_level(&name("secret"), Some(&key(BOB))), AccessLevel::NoAccess);
        assert_eq!(b.access_level(&name("secret"), None), AccessLevel::NoAccess);
    }

    #[test]
    fn unknown_keys_are_anonymous() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = access_config();
        config.anon_access = AccessLevel::NoAccess;
        config.users.retain(|u| u.name != "bob");
        let b = FsBackend::new(tmp.path(), &config).unwrap();
        assert_eq!(b.access_level(&name(""), Some(&key(BOB))), AccessLevel::NoAccess);
    }

    #[tokio::test]
    async fn repository_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        assert!(matches!(b.repository(&name("nope")).await, Err(BackendError::NotFound)));

        fake_bare_repo(&tmp.path().join("org/app.git"));
        let repo = b.repository(&name("org/app")).await.unwrap();
        assert_eq!(repo.path, tmp.path().join("org/app.git"));
        assert!(!repo.private);
    }

    #[tokio::test]
    async fn repository_lookup_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(&tmp.path().join("repos"));
        fake_bare_repo(&tmp.path().join("outside.git"));
        assert!(matches!(b.repository(&name("../outside")).await, Err(BackendError::Other(_))));
    }

    #[tokio::test]
    async fn create_existing_repository_reports_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        fake_bare_repo(&tmp.path().join("taken.git"));
        assert!(matches!(
            b.create_repository(&name("taken"), false).await,
            Err(BackendError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn create_rejects_empty_and_escaping_names() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(&tmp.path().join("repos"));
        assert!(b.create_repository(&name(""), false).await.is_err());
        assert!(b.create_repository(&name("../../evil"), false).await.is_err());
        assert!(!tmp.path().join("evil.git").exists());
    }

    #[tokio::test]
    async fn private_marker_is_honoured() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hidden.git");
        fake_bare_repo(&path);
        std::fs::write(path.join(PRIVATE_MARKER), b"").unwrap();
        let b = backend(tmp.path());

        assert_eq!(b.access_level(&name("hidden"), None), AccessLevel::NoAccess);
        assert_eq!(b.access_level(&name("hidden"), Some(&key(ROOT))), AccessLevel::Admin);
        assert!(b.repository(&name("hidden")).await.unwrap().private);
    }

    #[tokio::test]
    async fn private_marker_is_read_once_at_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        let path = tmp.path().join("late.git");
        fake_bare_repo(&path);
        std::fs::write(path.join(PRIVATE_MARKER), b"").unwrap();

        // Markers written behind the backend's back are not re-read per lookup.
        assert_eq!(b.access_level(&name("late"), None), AccessLevel::ReadOnly);
        assert_eq!(backend(tmp.path()).access_level(&name("late"), None), AccessLevel::NoAccess);
    }

    #[test]
    fn connection_level_access_of_a_known_user_never_drops_below_anonymous() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = access_config();
        config.users[1].access = AccessLevel::NoAccess;
        let b = FsBackend::new(tmp.path(), &config).unwrap();
        assert_eq!(b.access_level(&name(""), Some(&key(BOB))), AccessLevel::ReadOnly);
        assert_eq!(b.access_level(&name("public"), Some(&key(BOB))), AccessLevel::ReadOnly);
    }

    #[tokio::test]
    async fn list_repositories_returns_sanitized_names() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        fake_bare_repo(&tmp.path().join("a.git"));
        fake_bare_repo(&tmp.path().join("org/b.git"));
        let names = b.list_repositories().await.unwrap();
        assert_eq!(names, vec![name("a"), name("org/b")]);
    }
}
