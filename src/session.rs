//! Per-channel session state handed to the middleware chain.
//!
//! A [`Session`] bundles what the transport negotiated (identity, command
//! line, environment) with the channel's three byte streams.  The transport
//! owns the channel; the chain only borrows the session while it runs.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::auth::ClientKey;
use crate::error::SessionError;
use crate::git::pack::PackIo;
use crate::git::pktline;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Session {
    peer: Option<SocketAddr>,
    user: String,
    public_key: Option<ClientKey>,
    command: Vec<String>,
    env: Vec<(String, String)>,
    stdin: BoxReader,
    stdout: BoxWriter,
    stderr: BoxWriter,
    exit_status: Option<u32>,
    started: Instant,
}

impl Session {
    pub fn new(command: Vec<String>, stdin: BoxReader, stdout: BoxWriter, stderr: BoxWriter) -> Self {
        Self {
            peer: None,
            user: String::new(),
            public_key: None,
            command,
            env: Vec::new(),
            stdin,
            stdout,
            stderr,
            exit_status: None,
            started: Instant::now(),
        }
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_public_key(mut self, key: Option<ClientKey>) -> Self {
        self.public_key = key;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn public_key(&self) -> Option<&ClientKey> {
        self.public_key.as_ref()
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    /// Set once a stage has ended the session; later stages are skipped.
    pub fn is_terminated(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Borrow the streams for a delegated pack operation.
    pub fn pack_io(&mut self) -> PackIo<'_> {
        PackIo {
            stdin: &mut *self.stdin,
            stdout: &mut *self.stdout,
            stderr: &mut *self.stderr,
            env: &self.env,
        }
    }

    pub async fn write_stdout(&mut self, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        self.stdout.write_all(data).await?;
        self.stdout.flush().await
    }

    pub async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        self.stderr.write_all(data).await?;
        self.stderr.flush().await
    }

    /// End the session with `status` and close its output streams.
    /// Only the first call has any effect.
    pub async fn exit(&mut self, status: u32) {
        if self.is_terminated() {
            return;
        }
        self.exit_status = Some(status);
        if let Err(e) = self.stdout.shutdown().await {
            debug!(error = %e, "failed to close session stdout");
        }
        if let Err(e) = self.stderr.shutdown().await {
            debug!(error = %e, "failed to close session stderr");
        }
    }

    /// Report `err` to the client as a packet-line error and exit.
    pub async fn fatal(&mut self, err: &SessionError) {
        if !self.is_terminated() {
            if let Err(e) = pktline::write_error(&mut *self.stdout, err.client_message()).await {
                debug!(error = %e, "failed to write error to client");
            }
        }
        self.exit(err.exit_status()).await;
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_terminated() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session already exited"));
        }
        Ok(())
    }
}
