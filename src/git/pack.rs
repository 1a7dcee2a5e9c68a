//! Pack-protocol operations over a session's byte streams.
//!
//! The gateway does not speak the pack protocol itself.  [`PackService`] is
//! the seam to whatever does; [`GitBinary`] shells out to the system `git`,
//! wiring the session's input/output/error streams to the child's stdio.

use std::process::Stdio;

use anyhow::{anyhow, Context};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::bare_repo::validate_bare_repo;
use super::command::Service;
use crate::repo::RepoPath;

/// Environment variables a client may forward to the pack operation.
const FORWARDED_ENV: &[&str] = &["GIT_PROTOCOL"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PackError {
    /// The target is missing or not a repository.
    #[error("invalid repo")]
    InvalidRepository,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// The session streams handed to a pack operation.
pub struct PackIo<'a> {
    pub stdin: &'a mut (dyn AsyncRead + Send + Unpin),
    pub stdout: &'a mut (dyn AsyncWrite + Send + Unpin),
    pub stderr: &'a mut (dyn AsyncWrite + Send + Unpin),
    /// Environment negotiated by the client (e.g. `GIT_PROTOCOL`).
    pub env: &'a [(String, String)],
}

#[async_trait::async_trait]
pub trait PackService: Send + Sync {
    /// Run `service` against the repository at `repo` until the operation
    /// finishes or one of the streams closes.
    async fn serve(&self, service: Service, repo: &RepoPath, io: PackIo<'_>) -> Result<(), PackError>;
}

// ---------------------------------------------------------------------------
// git binary
// ---------------------------------------------------------------------------

/// [`PackService`] backed by `git receive-pack|upload-pack|upload-archive`.
#[derive(Debug, Clone)]
pub struct GitBinary {
    program: String,
}

impl Default for GitBinary {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitBinary {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl PackService for GitBinary {
    #[instrument(skip_all, fields(service = service.subcommand(), repo = %repo.as_path().display()))]
    async fn serve(&self, service: Service, repo: &RepoPath, io: PackIo<'_>) -> Result<(), PackError> {
        if !validate_bare_repo(repo.as_path()).await {
            return match service {
                Service::UploadPack | Service::UploadArchive => Err(PackError::InvalidRepository),
                Service::ReceivePack => Err(anyhow!(
                    "push target {} is not a bare repository",
                    repo.as_path().display()
                )
                .into()),
            };
        }

        let PackIo {
            stdin,
            stdout,
            stderr,
            env,
        } = io;

        let mut cmd = Command::new(&self.program);
        cmd.arg(service.subcommand()).arg(repo.as_path());
        for (key, value) in env {
            if FORWARDED_ENV.contains(&key.as_str()) {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn git {}", service.subcommand()))?;

        let mut child_stdin = child.stdin.take().context("child stdin was not piped")?;
        let mut child_stdout = child.stdout.take().context("child stdout was not piped")?;
        let mut child_stderr = child.stderr.take().context("child stderr was not piped")?;

        // Client input is forwarded until EOF; the child may finish first
        // (upload-pack after sending the pack), so input is not awaited.
        let (out, err, status) = {
            let feed = async move {
                let copied = tokio::io::copy(stdin, &mut child_stdin).await;
                let _ = child_stdin.shutdown().await;
                copied
            };

            let drain = async {
                let (out, err) = tokio::join!(
                    tokio::io::copy(&mut child_stdout, &mut *stdout),
                    tokio::io::copy(&mut child_stderr, &mut *stderr),
                );
                let status = child.wait().await;
                (out, err, status)
            };

            tokio::pin!(feed);
            tokio::pin!(drain);

            let mut feeding = true;
            loop {
                tokio::select! {
                    res = &mut feed, if feeding => {
                        feeding = false;
                        match res {
                            Ok(bytes) => debug!(bytes, "client input finished"),
                            Err(e) => debug!(error = %e, "client input closed with error"),
                        }
                    }
                    done = &mut drain => break done,
                }
            }
        };

        let sent = out.context("failed to stream pack output to client")?;
        err.context("failed to stream pack diagnostics to client")?;
        stdout.flush().await.context("failed to flush pack output")?;

        let status = status.context("failed to wait for git process")?;
        if !status.success() {
            return Err(anyhow!("git {} exited with {status}", service.subcommand()).into());
        }

        debug!(bytes = sent, "pack operation complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::ensure_within;

    async fn serve_missing(service: Service) -> PackError {
        let tmp = tempfile::tempdir().unwrap();
        let repo = ensure_within(tmp.path(), "missing.git").unwrap();

        let mut stdin: &[u8] = b"";
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let io = PackIo {
            stdin: &mut stdin,
            stdout: &mut stdout,
            stderr: &mut stderr,
            env: &[],
        };
        // A nonexistent program proves nothing gets spawned.
        let err = GitBinary::new("/nonexistent/git")
            .serve(service, &repo, io)
            .await
            .unwrap_err();
        assert!(stdout.is_empty());
        err
    }

    #[tokio::test]
    async fn upload_pack_on_missing_repo_is_invalid_repository() {
        let err = serve_missing(Service::UploadPack).await;
        assert!(matches!(err, PackError::InvalidRepository));
    }

    #[tokio::test]
    async fn upload_archive_on_missing_repo_is_invalid_repository() {
        let err = serve_missing(Service::UploadArchive).await;
        assert!(matches!(err, PackError::InvalidRepository));
    }

    #[tokio::test]
    async fn receive_pack_on_missing_repo_is_a_failure() {
        let err = serve_missing(Service::ReceivePack).await;
        assert!(matches!(err, PackError::Failed(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_classified_as_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repo.git");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        let repo = ensure_within(tmp.path(), "repo.git").unwrap();

        let mut stdin: &[u8] = b"";
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let io = PackIo {
            stdin: &mut stdin,
            stdout: &mut stdout,
            stderr: &mut stderr,
            env: &[],
        };
        let err = GitBinary::new("/nonexistent/git")
            .serve(Service::UploadPack, &repo, io)
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::Failed(_)));
    }
}
