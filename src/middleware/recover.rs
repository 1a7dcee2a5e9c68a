//! Panic containment for the rest of the chain.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::error;

use super::{Middleware, Next};
use crate::error::SessionError;
use crate::session::Session;

/// Turns a panic anywhere below it into a logged system failure that ends
/// only the affected session.
pub struct Recover;

#[async_trait]
impl Middleware for Recover {
    fn name(&self) -> &'static str {
        "recover"
    }

    async fn handle(&self, session: &mut Session, next: Next<'_>) {
        let outcome = AssertUnwindSafe(next.run(session)).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = panic_message(&*panic);
            error!(
                user = session.user(),
                command = ?session.command(),
                panic = %message,
                "session handler panicked"
            );
            session
                .fatal(&SessionError::SystemFailure(anyhow!("handler panicked: {message}")))
                .await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
