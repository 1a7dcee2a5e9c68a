//! Credential evaluation.
//!
//! Every authorization decision in the gateway, whether accepting a
//! connection or authorizing an operation on a repository, goes through
//! [`CredentialEvaluator::access_level`], so both paths share one policy
//! function and one threshold vocabulary.

use std::sync::Arc;

use tracing::debug;

use super::access::AccessLevel;
use super::key::ClientKey;
use crate::backend::Backend;
use crate::repo::RepoName;

#[derive(Clone)]
pub struct CredentialEvaluator {
    backend: Arc<dyn Backend>,
}

impl CredentialEvaluator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn access_level(&self, repo: &RepoName, key: Option<&ClientKey>) -> AccessLevel {
        let level = self.backend.access_level(repo, key);
        let fingerprint = key.map(ClientKey::fingerprint);
        debug!(
            repo = %repo,
            fingerprint = fingerprint.as_deref().unwrap_or("anonymous"),
            access = %level,
            "resolved access level"
        );
        level
    }

    /// Public-key authentication: accept iff the key has at least read
    /// access at connection level.
    pub fn accept_public_key(&self, key: &ClientKey) -> bool {
        self.access_level(&RepoName::default(), Some(key)).can_read()
    }

    /// Keyboard-interactive fallback: accept iff keyless access is enabled
    /// and the anonymous identity would pass the public-key check.
    pub fn accept_keyless(&self) -> bool {
        self.backend.allow_keyless() && self.access_level(&RepoName::default(), None).can_read()
    }
}
