//! The session handler chain.
//!
//! Every SSH exec or shell request runs one [`Session`] through an ordered
//! [`Chain`] of [`Middleware`] stages.  Each stage decides whether to call
//! the rest of the chain; once any stage has terminated the session (set an
//! exit status), later stages are skipped unless they opt in through
//! [`Middleware::runs_after_exit`].
//!
//! Standard order, outermost first:
//!
//! 1. [`recover::Recover`] contains panics raised further down.
//! 2. [`interactive::Interactive`] answers sessions without a command.
//! 3. [`cli::Cli`] answers the built-in non-git commands.
//! 4. [`dispatch::GitDispatch`] routes git pack commands.
//! 5. [`logging::AccessLog`] records how the session ended.

pub mod cli;
pub mod dispatch;
pub mod interactive;
pub mod logging;
pub mod recover;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::session::Session;
use crate::AppState;

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this stage still runs after an earlier stage terminated the
    /// session.
    fn runs_after_exit(&self) -> bool {
        false
    }

    async fn handle(&self, session: &mut Session, next: Next<'_>);
}

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, session: &mut Session) {
        let mut stages = self.stages;
        while let Some((stage, rest)) = stages.split_first() {
            if session.is_terminated() && !stage.runs_after_exit() {
                trace!(stage = stage.name(), "skipping stage for terminated session");
                stages = rest;
                continue;
            }
            return stage.handle(session, Next { stages: rest }).await;
        }
    }
}

#[derive(Clone)]
pub struct Chain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    /// The production chain in its fixed order.
    pub fn standard(state: &AppState) -> Self {
        let stages: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(recover::Recover),
            Arc::new(interactive::Interactive::new(state.clone())),
            Arc::new(cli::Cli::new(state.clone())),
            Arc::new(dispatch::GitDispatch::new(dispatch::Dispatcher::from_state(state))),
            Arc::new(logging::AccessLog),
        ];
        Self::new(stages)
    }

    pub async fn run(&self, session: &mut Session) {
        Next { stages: &self.stages }.run(session).await;
    }
}
