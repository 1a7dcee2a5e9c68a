//! Built-in commands for sessions that are not git transport requests.

use std::fmt::Write as _;

use async_trait::async_trait;
use tracing::{debug, info};

use super::interactive::readable_repositories;
use super::{Middleware, Next};
use crate::auth::ClientKey;
use crate::git::GitCommand;
use crate::repo::RepoName;
use crate::session::Session;
use crate::AppState;

const USAGE: &str = "\
Commands:
  help        show this message
  info        show the identity this session authenticated as
  repo list   list the repositories you can read

Git clients connect with git-upload-pack, git-receive-pack and
git-upload-archive.
";

pub struct Cli {
    state: AppState,
}

impl Cli {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Output for a recognised command, or `None` when the command is
    /// unknown.
    async fn run_command(&self, command: &[String], user: &str, key: Option<&ClientKey>) -> Option<String> {
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["help"] => Some(USAGE.to_string()),
            ["info"] => Some(self.info(user, key)),
            ["repo", "list"] => {
                let repos = readable_repositories(&self.state, key).await;
                let mut out = String::new();
                for repo in &repos {
                    let _ = writeln!(out, "{repo}");
                }
                Some(out)
            }
            _ => None,
        }
    }

    fn info(&self, user: &str, key: Option<&ClientKey>) -> String {
        let access = self.state.evaluator.access_level(&RepoName::default(), key);
        let mut out = String::new();
        let _ = writeln!(out, "user: {user}");
        match key {
            Some(key) => {
                let _ = writeln!(out, "key: {} {}", key.algorithm(), key.fingerprint());
            }
            None => {
                let _ = writeln!(out, "key: none");
            }
        }
        let _ = writeln!(out, "access: {access}");
        out
    }
}

#[async_trait]
impl Middleware for Cli {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn handle(&self, session: &mut Session, next: Next<'_>) {
        let is_cli = !session.command().is_empty() && GitCommand::parse(session.command()) == GitCommand::Other;
        if is_cli {
            let command = session.command().to_vec();
            let user = session.user().to_string();
            let key = session.public_key().cloned();
            match self.run_command(&command, &user, key.as_ref()).await {
                Some(output) => {
                    if let Err(e) = session.write_stdout(output.as_bytes()).await {
                        debug!(error = %e, "failed to write command output");
                    }
                    session.exit(0).await;
                }
                None => {
                    let line = command.join(" ");
                    info!(user = %user, command = %line, "unknown command");
                    let message = format!("unknown command: {line}\nRun 'help' for usage.\n");
                    if let Err(e) = session.write_stderr(message.as_bytes()).await {
                        debug!(error = %e, "failed to write command error");
                    }
                    session.exit(1).await;
                }
            }
        }
        next.run(session).await;
    }
}
