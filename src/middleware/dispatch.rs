//! Protocol dispatcher: routes git pack commands to the pack service.
//!
//! For every recognised git command the dispatcher
//!
//! 1. sanitizes the repository name and confines its on-disk path to the
//!    repository store,
//! 2. resolves the caller's access level through the credential evaluator,
//! 3. authorizes the operation (push needs read-write, fetch and archive
//!    need read-only),
//! 4. auto-creates the repository on first push, and
//! 5. delegates the byte streams to the [`PackService`].
//!
//! Authorization happens before the existence check, so a caller without
//! read access learns nothing about which repositories exist.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::{Middleware, Next};
use crate::auth::CredentialEvaluator;
use crate::backend::{Backend, BackendError};
use crate::error::SessionError;
use crate::git::{GitCommand, PackError, PackService, Service};
use crate::repo::{repo_path, RepoName, RepoPath};
use crate::session::Session;
use crate::AppState;

/// What the dispatcher did with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a git command; left for later stages.
    Passed,
    /// The pack operation ran to completion.
    Completed,
}

#[derive(Clone)]
pub struct Dispatcher {
    repos_root: PathBuf,
    evaluator: CredentialEvaluator,
    backend: Arc<dyn Backend>,
    pack: Arc<dyn PackService>,
}

impl Dispatcher {
    pub fn new(
        repos_root: impl Into<PathBuf>,
        evaluator: CredentialEvaluator,
        backend: Arc<dyn Backend>,
        pack: Arc<dyn PackService>,
    ) -> Self {
        Self {
            repos_root: repos_root.into(),
            evaluator,
            backend,
            pack,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.config.repos_path(),
            state.evaluator.clone(),
            state.backend.clone(),
            state.pack.clone(),
        )
    }

    #[instrument(skip_all, fields(user = session.user()))]
    pub async fn dispatch(&self, session: &mut Session) -> Result<Dispatch, SessionError> {
        let command = GitCommand::parse(session.command());
        let (Some(service), Some(name)) = (command.service(), command.repo()) else {
            return Ok(Dispatch::Passed);
        };

        let path = repo_path(&self.repos_root, name)?;
        if name.is_empty() {
            return Err(SessionError::InvalidRepository);
        }

        let access = self.evaluator.access_level(name, session.public_key());
        debug!(repo = %name, service = service.subcommand(), access = %access, "dispatching git command");

        match service {
            Service::ReceivePack => {
                if !access.can_write() {
                    return Err(SessionError::NotAuthorized);
                }
                self.ensure_repository(name).await?;
                self.serve(service, &path, session).await
            }
            Service::UploadPack | Service::UploadArchive => {
                if !access.can_read() {
                    return Err(SessionError::NotAuthorized);
                }
                self.serve(service, &path, session).await
            }
        }
    }

    async fn serve(&self, service: Service, path: &RepoPath, session: &mut Session) -> Result<Dispatch, SessionError> {
        match self.pack.serve(service, path, session.pack_io()).await {
            Ok(()) => Ok(Dispatch::Completed),
            Err(PackError::InvalidRepository) => Err(SessionError::InvalidRepository),
            Err(PackError::Failed(e)) => Err(SessionError::SystemFailure(e)),
        }
    }

    /// Make sure a push target exists, creating it on first push.  Losing a
    /// creation race to a concurrent push is not an error.
    async fn ensure_repository(&self, name: &RepoName) -> Result<(), SessionError> {
        match self.backend.repository(name).await {
            Ok(_) => return Ok(()),
            Err(BackendError::NotFound) => {}
            Err(e) => {
                return Err(SessionError::SystemFailure(
                    anyhow::Error::from(e).context(format!("failed to look up repository {name}")),
                ))
            }
        }

        match self.backend.create_repository(name, false).await {
            Ok(repo) => {
                info!(repo = %repo.name, path = %repo.path.display(), "created repository on first push");
                Ok(())
            }
            Err(BackendError::AlreadyExists) => {
                debug!(repo = %name, "repository created concurrently");
                self.backend
                    .repository(name)
                    .await
                    .map(|_| ())
                    .with_context(|| format!("repository {name} vanished after concurrent creation"))
                    .map_err(SessionError::SystemFailure)
            }
            Err(e) => Err(SessionError::SystemFailure(
                anyhow::Error::from(e).context(format!("failed to create repository {name}")),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Chain stage
// ---------------------------------------------------------------------------

pub struct GitDispatch {
    dispatcher: Dispatcher,
}

impl GitDispatch {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Middleware for GitDispatch {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn handle(&self, session: &mut Session, next: Next<'_>) {
        match self.dispatcher.dispatch(session).await {
            Ok(Dispatch::Passed) => {}
            Ok(Dispatch::Completed) => session.exit(0).await,
            Err(err) => {
                match &err {
                    SessionError::NotAuthorized => {
                        warn!(user = session.user(), command = ?session.command(), "git command denied")
                    }
                    SessionError::InvalidRepository => {
                        info!(user = session.user(), command = ?session.command(), "invalid repository requested")
                    }
                    SessionError::PathEscape(e) => {
                        warn!(user = session.user(), error = %e, "rejected repository path outside the store")
                    }
                    SessionError::SystemFailure(e) => {
                        error!(user = session.user(), command = ?session.command(), error = %format!("{e:#}"), "git command failed")
                    }
                }
                session.fatal(&err).await;
            }
        }
        next.run(session).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
