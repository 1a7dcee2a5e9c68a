//! Failure taxonomy for a git session.
//!
//! Every fatal path funnels into one [`SessionError`], which the session
//! reports to the client as a single packet-line error before exiting with
//! status 1.  Client-visible messages never carry internal detail.

use thiserror::Error;

use crate::repo::PathEscape;

/// Exit status of a session terminated by a [`SessionError`].
pub const FATAL_EXIT_STATUS: u32 = 1;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Access level below what the operation requires.
    #[error("not authorized")]
    NotAuthorized,
    /// The target repository is missing or malformed.
    #[error("invalid repository")]
    InvalidRepository,
    /// The repository path failed confinement.
    #[error(transparent)]
    PathEscape(#[from] PathEscape),
    /// Repository creation or the delegated operation failed.
    #[error("system failure: {0:#}")]
    SystemFailure(anyhow::Error),
}

impl SessionError {
    /// The message written to the client.
    pub fn client_message(&self) -> &'static str {
        match self {
            SessionError::NotAuthorized => "you are not authorized to do this",
            SessionError::InvalidRepository => "invalid repo",
            SessionError::PathEscape(_) | SessionError::SystemFailure(_) => "something went wrong",
        }
    }

    pub fn exit_status(&self) -> u32 {
        FATAL_EXIT_STATUS
    }
}
