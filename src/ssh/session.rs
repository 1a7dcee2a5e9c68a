//! SSH connection handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler authenticates the client through the [`CredentialEvaluator`],
//! collects per-channel environment, and turns every exec or shell request
//! into a core [`crate::session::Session`] that runs through the middleware
//! [`Chain`] on its own worker task.
//!
//! Channel data is bridged with in-memory pipes: client input is written to
//! the session's stdin pipe from [`Handler::data`], and the session's output
//! and error pipes are pumped back to the channel through a [`Handle`].
//!
//! russh re-opens the client's window as soon as data arrives, so the stdin
//! pipe is the only backpressure.  A write into it blocks the whole
//! connection loop, so it is bounded by the idle timeout and by the
//! connection's cancellation token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use russh::server::{self, Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{ClientKey, CredentialEvaluator};
use crate::git::split_command_line;
use crate::middleware::Chain;
use crate::session::Session as GitSession;

/// Buffer size of each in-memory pipe between the channel and the chain.
const PIPE_CAPACITY: usize = 64 * 1024;

/// SSH extended-data type code for stderr (RFC 4254 section 5.2).
const EXTENDED_DATA_STDERR: u32 = 1;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelState {
    env: Vec<(String, String)>,
    /// Write half of the running session's stdin; `None` before the exec
    /// request and after the client's EOF.
    stdin: Option<DuplexStream>,
    started: bool,
}

/// Per-connection SSH session state.
pub struct SshSession {
    evaluator: CredentialEvaluator,
    chain: Arc<Chain>,
    peer_addr: Option<SocketAddr>,
    user: Option<String>,
    key: Option<ClientKey>,
    channels: HashMap<ChannelId, ChannelState>,
    /// Session workers; dropped (and so aborted) with the connection.
    workers: JoinSet<()>,
    /// Longest a client write may wait on a session that is not reading.
    idle_timeout: Option<Duration>,
    /// Cancelled when the server terminates this connection.
    cancel: CancellationToken,
}

impl SshSession {
    pub fn new(
        evaluator: CredentialEvaluator,
        chain: Arc<Chain>,
        peer_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            evaluator,
            chain,
            peer_addr,
            user: None,
            key: None,
            channels: HashMap::new(),
            workers: JoinSet::new(),
            idle_timeout: None,
            cancel,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Build a core session for `channel_id` and run it through the chain
    /// on a worker task.
    fn start(&mut self, channel_id: ChannelId, command: Vec<String>, session: &mut Session) {
        // Reap workers of channels that already finished.
        while self.workers.try_join_next().is_some() {}

        let channel = self.channels.entry(channel_id).or_default();
        if channel.started {
            warn!(peer = ?self.peer_addr, "ignoring second exec request on channel");
            session.channel_failure(channel_id);
            return;
        }
        channel.started = true;

        let (stdin_tx, stdin_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        channel.stdin = Some(stdin_tx);

        let git_session = GitSession::new(command, Box::new(stdin_rx), Box::new(stdout_tx), Box::new(stderr_tx))
            .with_peer(self.peer_addr)
            .with_user(self.user.clone().unwrap_or_default())
            .with_public_key(self.key.clone())
            .with_env(channel.env.clone());

        session.channel_success(channel_id);
        let handle = session.handle();
        let chain = Arc::clone(&self.chain);
        self.workers
            .spawn(run_channel(chain, git_session, handle, channel_id, stdout_rx, stderr_rx));
    }
}

/// Drive one session through the chain while pumping its output to the
/// channel, then close the channel with the session's exit status.
async fn run_channel(
    chain: Arc<Chain>,
    mut git_session: GitSession,
    handle: Handle,
    channel_id: ChannelId,
    stdout: DuplexStream,
    stderr: DuplexStream,
) {
    let run = async move {
        chain.run(&mut git_session).await;
        // Dropping the session closes the pipes so both pumps drain and end.
        git_session.exit_status().unwrap_or(0)
    };
    let (exit_status, (), ()) = tokio::join!(
        run,
        pump(handle.clone(), channel_id, stdout, None),
        pump(handle.clone(), channel_id, stderr, Some(EXTENDED_DATA_STDERR)),
    );

    // RFC 4254: exit-status, then EOF, then close.
    let _ = handle.exit_status_request(channel_id, exit_status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

// ---------------------------------------------------------------------------
// Client input
// ---------------------------------------------------------------------------

/// Result of forwarding one chunk of client input to a session.
#[derive(Debug)]
enum Feed {
    Written,
    /// The session stopped reading its input for good.
    Closed(std::io::Error),
    /// The session did not take the chunk within the idle timeout.
    Stalled,
    /// The connection is being torn down.
    Cancelled,
}

async fn feed_stdin(
    stdin: &mut DuplexStream,
    data: &[u8],
    idle_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Feed {
    let stalled = async {
        match idle_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = stdin.write_all(data) => match res {
            Ok(()) => Feed::Written,
            Err(e) => Feed::Closed(e),
        },
        () = stalled => Feed::Stalled,
        () = cancel.cancelled() => Feed::Cancelled,
    }
}

async fn pump(handle: Handle, channel_id: ChannelId, mut reader: DuplexStream, ext: Option<u32>) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "session pipe read failed");
                break;
            }
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(code) => handle.extended_data(channel_id, code, data).await,
            None => handle.data(channel_id, data).await,
        };
        if sent.is_err() {
            debug!("channel closed while sending session output");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Accept a public key iff it holds at least read access at connection
    /// level.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let key = ClientKey::from(key);
        let fingerprint = key.fingerprint();
        if self.evaluator.accept_public_key(&key) {
            info!(peer = ?self.peer_addr, user = %user, fingerprint = %fingerprint, "public-key auth accepted");
            self.user = Some(user.to_string());
            self.key = Some(key);
            Ok(Auth::Accept)
        } else {
            warn!(peer = ?self.peer_addr, user = %user, fingerprint = %fingerprint, "public-key auth rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    /// Keyless fallback for clients without a usable key.  No prompts are
    /// sent; the decision rests on policy alone.
    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<server::Response<'async_trait>>,
    ) -> Result<Auth, Self::Error> {
        if self.evaluator.accept_keyless() {
            info!(peer = ?self.peer_addr, user = %user, "keyless auth accepted");
            self.user = Some(user.to_string());
            self.key = None;
            Ok(Auth::Accept)
        } else {
            warn!(peer = ?self.peer_addr, user = %user, "keyless auth rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    /// Capture environment variables sent before the exec request, e.g.
    /// `GIT_PROTOCOL=version=2`.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(name = %variable_name, value = %variable_value, "captured client environment");
        self.channels
            .entry(channel)
            .or_default()
            .env
            .push((variable_name.to_string(), variable_value.to_string()));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data);
        debug!(peer = ?self.peer_addr, user = ?self.user, command = %raw, "exec request");
        self.start(channel, split_command_line(&raw), session);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, user = ?self.user, "shell request");
        self.start(channel, Vec::new(), session);
        Ok(())
    }

    /// Forward client data to the running session's stdin.  Failing here
    /// ends the whole connection.
    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let Some(stdin) = state.stdin.as_mut() else {
            return Ok(());
        };

        let fed = feed_stdin(stdin, data, self.idle_timeout, &self.cancel).await;
        match fed {
            Feed::Written => Ok(()),
            Feed::Closed(e) => {
                debug!(error = %e, "session no longer reading input");
                state.stdin = None;
                Ok(())
            }
            Feed::Stalled => {
                warn!(peer = ?self.peer_addr, user = ?self.user, "session input stalled past the idle timeout");
                bail!("session input stalled past the idle timeout")
            }
            Feed::Cancelled => bail!("connection terminated"),
        }
    }

    /// Dropping the stdin pipe signals EOF to the running session.
    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
