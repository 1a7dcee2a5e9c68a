//! SSH transport for the gateway.
//!
//! Accepts SSH connections, authenticates them through the credential
//! evaluator (public key, or keyless keyboard-interactive when policy allows)
//! and feeds every exec/shell request into the session handler chain.

pub mod hostkey;
pub mod server;
pub mod session;
pub mod stream;

pub use hostkey::load_or_generate_host_key;
pub use server::SshServer;
