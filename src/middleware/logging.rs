//! Per-session access log.

use async_trait::async_trait;
use tracing::info;

use super::{Middleware, Next};
use crate::session::Session;

/// Records how every session ended.  Runs even when an earlier stage
/// terminated the session.
pub struct AccessLog;

#[async_trait]
impl Middleware for AccessLog {
    fn name(&self) -> &'static str {
        "access-log"
    }

    fn runs_after_exit(&self) -> bool {
        true
    }

    async fn handle(&self, session: &mut Session, next: Next<'_>) {
        next.run(session).await;

        let fingerprint = session.public_key().map(|k| k.fingerprint());
        info!(
            peer = ?session.peer(),
            user = session.user(),
            fingerprint = fingerprint.as_deref().unwrap_or("none"),
            command = %session.command().join(" "),
            exit_status = ?session.exit_status(),
            elapsed_ms = session.elapsed().as_millis() as u64,
            "session finished"
        );
    }
}
