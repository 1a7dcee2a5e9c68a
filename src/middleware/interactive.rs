//! Interactive login handling.
//!
//! A session without a command (a plain `ssh host`) gets a short welcome
//! screen listing the repositories its identity can read, then exits 0.

use std::fmt::Write as _;
use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::auth::ClientKey;
use crate::repo::RepoName;
use crate::session::Session;
use crate::AppState;

pub struct Interactive {
    state: AppState,
}

impl Interactive {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    async fn welcome(&self, key: Option<&ClientKey>) -> String {
        let repos = readable_repositories(&self.state, key).await;
        let port = self
            .state
            .config
            .ssh
            .listen_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(22);

        let mut screen = String::new();
        let _ = writeln!(screen, "Welcome to {}!", self.state.config.name);
        let _ = writeln!(screen);
        if repos.is_empty() {
            let _ = writeln!(screen, "No repositories available yet.");
        } else {
            let _ = writeln!(screen, "Repositories:");
            for repo in &repos {
                let _ = writeln!(screen, "  {repo}");
            }
        }
        let _ = writeln!(screen);
        let example = repos.first().map(RepoName::as_str).unwrap_or("<repo>");
        let _ = writeln!(screen, "Clone with: git clone ssh://<host>:{port}/{example}.git");
        screen
    }
}

#[async_trait]
impl Middleware for Interactive {
    fn name(&self) -> &'static str {
        "interactive"
    }

    async fn handle(&self, session: &mut Session, next: Next<'_>) {
        if session.command().is_empty() {
            let key = session.public_key().cloned();
            let screen = self.welcome(key.as_ref()).await;
            if let Err(e) = session.write_stdout(screen.as_bytes()).await {
                debug!(error = %e, "failed to write welcome screen");
            }
            session.exit(0).await;
        }
        next.run(session).await;
    }
}

/// Repositories `key` (or the anonymous identity) may read.  A store that
/// cannot be listed yields an empty list.
pub(crate) async fn readable_repositories(state: &AppState, key: Option<&ClientKey>) -> Vec<RepoName> {
    match state.backend.list_repositories().await {
        Ok(names) => names
            .into_iter()
            .filter(|name| state.evaluator.access_level(name, key).can_read())
            .collect(),
        Err(e) => {
            warn!(error = %e, "failed to list repositories");
            Vec::new()
        }
    }
}
