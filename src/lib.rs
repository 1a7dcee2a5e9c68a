//! SSH transport and authorization gateway for the git pack protocol.
//!
//! Accepts authenticated SSH sessions, classifies the requested command,
//! authorizes it against the repository it names, confines the repository
//! path to the store and hands the session's byte streams to a pack
//! operation.

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod git;
pub mod middleware;
pub mod repo;
pub mod session;
pub mod ssh;

use std::sync::Arc;

use crate::auth::CredentialEvaluator;
use crate::backend::Backend;
use crate::config::Config;
use crate::git::PackService;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by the SSH layer and every chain stage.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn Backend>,
    pub evaluator: CredentialEvaluator,
    /// Pack-protocol operations (fetch, push, archive).
    pub pack: Arc<dyn PackService>,
}

impl AppState {
    pub fn new(config: Arc<Config>, backend: Arc<dyn Backend>, pack: Arc<dyn PackService>) -> Self {
        let evaluator = CredentialEvaluator::new(Arc::clone(&backend));
        Self {
            config,
            backend,
            evaluator,
            pack,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(backend: crate::backend::memory::MemoryBackend) -> AppState {
    let config = Config::from_yaml("data_path: /srv\n").unwrap();
    AppState::new(
        Arc::new(config),
        Arc::new(backend),
        Arc::new(crate::git::GitBinary::default()),
    )
}
