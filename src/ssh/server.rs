//! SSH listener, per-connection supervision and shutdown.
//!
//! [`SshServer`] owns the accept loop.  Every accepted TCP connection runs
//! on a task registered with a [`TaskTracker`] so that a graceful shutdown
//! can wait for in-flight sessions, and under a supervisor that enforces the
//! absolute session timeout and reacts to the kill signal.
//!
//! A connection counts as finished only once its russh session loop has
//! returned.  Terminating one first asks the client to disconnect, then
//! cancels the connection's token, which fails the socket and any blocked
//! input write so the loop unwinds even when the peer has stalled.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::server;
use russh::{Disconnect, MethodSet};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::session::SshSession;
use super::stream::CancellableStream;
use crate::middleware::Chain;
use crate::AppState;

/// How long a terminated connection gets to process the disconnect request
/// before its transport is cut.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

/// How a supervised connection ended.
#[derive(Debug)]
pub enum ConnectionOutcome<E> {
    Completed,
    Failed(E),
    /// The absolute session timeout elapsed.
    TimedOut,
    /// The server was closed or its shutdown deadline passed.
    Killed,
}

/// Run `connection` until it finishes, `max_timeout` elapses or `kill` is
/// cancelled, whichever comes first.
pub async fn supervise<F, E>(
    connection: F,
    max_timeout: Option<Duration>,
    kill: &CancellationToken,
) -> ConnectionOutcome<E>
where
    F: Future<Output = Result<(), E>>,
{
    let deadline = async {
        match max_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = connection => match res {
            Ok(()) => ConnectionOutcome::Completed,
            Err(e) => ConnectionOutcome::Failed(e),
        },
        () = deadline => ConnectionOutcome::TimedOut,
        () = kill.cancelled() => ConnectionOutcome::Killed,
    }
}

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: AppState,
    chain: Arc<Chain>,
    config: Arc<server::Config>,
    tracker: TaskTracker,
    /// Cancelled to stop the accept loop.
    accepting: CancellationToken,
    /// Cancelled to drop every live connection.
    kill: CancellationToken,
}

impl SshServer {
    pub fn new(state: AppState, host_key: KeyPair) -> Self {
        let ssh = &state.config.ssh;
        let config = Arc::new(server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY | MethodSet::KEYBOARD_INTERACTIVE,
            inactivity_timeout: ssh.idle_timeout(),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: ssh.max_auth_attempts,
            ..Default::default()
        });
        let chain = Arc::new(Chain::standard(&state));

        Self {
            state,
            chain,
            config,
            tracker: TaskTracker::new(),
            accepting: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    /// Bind `ssh.listen_addr` and serve until the server is closed or shut
    /// down.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .state
            .config
            .ssh
            .listen_addr
            .parse()
            .with_context(|| format!("invalid SSH listen address: {:?}", self.state.config.ssh.listen_addr))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind SSH listener on {addr}"))?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until the server stops accepting.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        info!(address = %local, "SSH server listening");

        loop {
            tokio::select! {
                () = self.accepting.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        // Typically EMFILE or a connection reset before accept.
                        warn!(error = %e, "failed to accept SSH connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(address = %local, "SSH server stopped accepting connections");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        info!(peer = %peer, "new SSH client connection");
        let ssh = &self.state.config.ssh;
        let cancel = self.kill.child_token();
        let handler = SshSession::new(self.state.evaluator.clone(), Arc::clone(&self.chain), Some(peer), cancel.clone())
            .with_idle_timeout(ssh.idle_timeout());
        let config = Arc::clone(&self.config);
        let max_timeout = ssh.max_timeout();

        self.tracker.spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }
            let stream = CancellableStream::new(stream, cancel.clone());
            let mut running = match server::run_stream(config, stream, handler).await {
                Ok(running) => running,
                Err(e) => {
                    warn!(peer = %peer, error = %format!("{e:#}"), "SSH handshake failed");
                    return;
                }
            };
            let handle = running.handle();

            match supervise(&mut running, max_timeout, &cancel).await {
                ConnectionOutcome::Completed => {
                    debug!(peer = %peer, "SSH connection closed");
                }
                ConnectionOutcome::Failed(e) => {
                    debug!(peer = %peer, error = %format!("{e:#}"), "SSH connection ended with error");
                }
                ConnectionOutcome::TimedOut => {
                    info!(peer = %peer, "SSH connection exceeded max timeout");
                    let polite = async {
                        let _ = handle
                            .disconnect(Disconnect::ByApplication, "session timed out".to_string(), String::new())
                            .await;
                        let _ = (&mut running).await;
                    };
                    if tokio::time::timeout(DISCONNECT_GRACE, polite).await.is_err() {
                        debug!(peer = %peer, "client ignored disconnect; cutting transport");
                        cancel.cancel();
                        let _ = running.await;
                    }
                }
                ConnectionOutcome::Killed => {
                    info!(peer = %peer, "SSH connection killed by server shutdown");
                    let _ = running.await;
                }
            }
        });
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting and drop every live connection immediately.
    pub fn close(&self) {
        info!(active = self.active_connections(), "closing SSH server");
        self.accepting.cancel();
        self.kill.cancel();
        self.tracker.close();
    }

    /// Stop accepting and wait up to `grace` for live connections to finish.
    /// Connections still running at the deadline are killed and an error is
    /// returned.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        info!(active = self.active_connections(), grace_secs = grace.as_secs(), "shutting down SSH server");
        self.accepting.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("SSH server shut down cleanly");
            return Ok(());
        }

        let remaining = self.active_connections();
        error!(remaining, "shutdown deadline elapsed; killing remaining SSH connections");
        self.kill.cancel();
        self.tracker.wait().await;
        bail!("shutdown deadline elapsed with {remaining} SSH connection(s) still running");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use russh::client;
    use russh_keys::key::PublicKey;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::config::Config;
    use crate::git::{PackError, PackIo, PackService, Service};
    use crate::repo::RepoPath;
    use crate::test_state;

    fn test_server() -> SshServer {
        SshServer::new(test_state(MemoryBackend::new("/r")), KeyPair::generate_ed25519())
    }

    // ---- loopback harness ----

    /// Pack operation that never reads its input and records when it is
    /// dropped, the way a git child is reaped through `kill_on_drop`.
    #[derive(Default)]
    struct StalledPack {
        started: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl PackService for StalledPack {
        async fn serve(&self, _service: Service, _repo: &RepoPath, _io: PackIo<'_>) -> Result<(), PackError> {
            let _guard = DropFlag(Arc::clone(&self.dropped));
            self.started.store(true, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    struct TestClient;

    #[async_trait::async_trait]
    impl client::Handler for TestClient {
        type Error = russh::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    async fn start_server(ssh_yaml: &str, pack: Arc<StalledPack>) -> (Arc<SshServer>, SocketAddr) {
        let config = Config::from_yaml(&format!("data_path: /srv\nssh:\n{ssh_yaml}")).unwrap();
        let state = AppState::new(Arc::new(config), Arc::new(MemoryBackend::new("/srv/repos")), pack);
        let server = Arc::new(SshServer::new(state, KeyPair::generate_ed25519()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });
        (server, addr)
    }

    /// Connect, authenticate and start a fetch against the stalled pack.
    async fn start_fetch(addr: SocketAddr, pack: &StalledPack) -> (client::Handle<TestClient>, russh::Channel<client::Msg>) {
        let mut handle = client::connect(Arc::new(client::Config::default()), addr, TestClient)
            .await
            .unwrap();
        let key = Arc::new(KeyPair::generate_ed25519());
        assert!(handle.authenticate_publickey("git", key).await.unwrap());

        let channel = handle.channel_open_session().await.unwrap();
        channel.exec(true, "git-upload-pack '/app.git'").await.unwrap();
        assert!(eventually(Duration::from_secs(5), || pack.started.load(Ordering::SeqCst)).await);
        (handle, channel)
    }

    /// Keep writing input the stalled operation will never read.
    fn flood(channel: russh::Channel<client::Msg>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let payload = vec![b'x'; 1024 * 1024];
            let _ = channel.data(&payload[..]).await;
            // Keep the channel open after the write returns.
            std::future::pending::<()>().await;
        })
    }

    async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn supervise_reports_completion_and_failure() {
        let kill = CancellationToken::new();
        let done = supervise(async { Ok::<(), &str>(()) }, None, &kill).await;
        assert!(matches!(done, ConnectionOutcome::Completed));

        let failed = supervise(async { Err::<(), _>("reset") }, None, &kill).await;
        assert!(matches!(failed, ConnectionOutcome::Failed("reset")));
    }

    #[tokio::test]
    async fn supervise_enforces_max_timeout() {
        let kill = CancellationToken::new();
        let started = Instant::now();
        let outcome = supervise(
            std::future::pending::<Result<(), ()>>(),
            Some(Duration::from_millis(50)),
            &kill,
        )
        .await;
        assert!(matches!(outcome, ConnectionOutcome::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn supervise_stops_on_kill() {
        let kill = CancellationToken::new();
        kill.cancel();
        let outcome = supervise(std::future::pending::<Result<(), ()>>(), None, &kill).await;
        assert!(matches!(outcome, ConnectionOutcome::Killed));
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let server = Arc::new(test_server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_connections_that_finish_in_time() {
        let server = test_server();
        server.tracker.spawn(tokio::time::sleep(Duration::from_millis(50)));
        server.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn shutdown_kills_connections_past_the_deadline() {
        let server = test_server();
        let kill = server.kill.clone();
        server.tracker.spawn(async move {
            let outcome = supervise(std::future::pending::<Result<(), ()>>(), None, &kill).await;
            assert!(matches!(outcome, ConnectionOutcome::Killed));
        });

        let err = server.shutdown(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.to_string().contains("1 SSH connection"));
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn close_kills_immediately() {
        let server = test_server();
        let kill = server.kill.clone();
        let task = server.tracker.spawn(async move {
            supervise(std::future::pending::<Result<(), ()>>(), None, &kill).await
        });
        server.close();
        assert!(matches!(task.await.unwrap(), ConnectionOutcome::Killed));
    }

    #[test]
    fn idle_timeout_configures_the_transport() {
        let config = Config::from_yaml("data_path: /srv\nssh:\n  idle_timeout: 7\n").unwrap();
        let state = AppState::new(
            Arc::new(config),
            Arc::new(MemoryBackend::new("/srv/repos")),
            Arc::new(crate::git::GitBinary::default()),
        );
        let server = SshServer::new(state, KeyPair::generate_ed25519());
        assert_eq!(server.config.inactivity_timeout, Some(Duration::from_secs(7)));

        assert_eq!(test_server().config.inactivity_timeout, None);
    }

    #[tokio::test]
    async fn idle_timeout_ends_a_quiet_session() {
        let pack = Arc::new(StalledPack::default());
        let (server, addr) = start_server("  idle_timeout: 1\n", Arc::clone(&pack)).await;
        let (_client, _channel) = start_fetch(addr, &pack).await;

        assert!(eventually(Duration::from_secs(5), || pack.dropped.load(Ordering::SeqCst)).await);
        assert!(eventually(Duration::from_secs(2), || server.active_connections() == 0).await);
    }

    #[tokio::test]
    async fn idle_timeout_ends_a_session_whose_input_is_not_read() {
        let pack = Arc::new(StalledPack::default());
        let (server, addr) = start_server("  idle_timeout: 1\n", Arc::clone(&pack)).await;
        let (_client, channel) = start_fetch(addr, &pack).await;
        let flooding = flood(channel);

        assert!(eventually(Duration::from_secs(5), || pack.dropped.load(Ordering::SeqCst)).await);
        assert!(eventually(Duration::from_secs(2), || server.active_connections() == 0).await);
        flooding.abort();
    }

    #[tokio::test]
    async fn max_timeout_ends_a_session_whose_input_is_not_read() {
        let pack = Arc::new(StalledPack::default());
        let (server, addr) = start_server("  max_timeout: 1\n", Arc::clone(&pack)).await;
        let started = Instant::now();
        let (_client, channel) = start_fetch(addr, &pack).await;
        let flooding = flood(channel);

        assert!(eventually(Duration::from_secs(6), || pack.dropped.load(Ordering::SeqCst)).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(eventually(Duration::from_secs(2), || server.active_connections() == 0).await);
        flooding.abort();
    }

    #[tokio::test]
    async fn shutdown_deadline_ends_a_session_whose_input_is_not_read() {
        let pack = Arc::new(StalledPack::default());
        let (server, addr) = start_server("  max_auth_attempts: 6\n", Arc::clone(&pack)).await;
        let (_client, channel) = start_fetch(addr, &pack).await;
        let flooding = flood(channel);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = tokio::time::timeout(Duration::from_secs(5), server.shutdown(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("1 SSH connection"));
        // The connection task only finishes once the session loop has returned.
        assert_eq!(server.active_connections(), 0);
        assert!(eventually(Duration::from_secs(2), || pack.dropped.load(Ordering::SeqCst)).await);
        flooding.abort();
    }
}
