//! Git command parsing, packet-line framing and pack-protocol delegation.
//!
//! Pack operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution; nothing here speaks the pack protocol itself.

pub mod bare_repo;
pub mod command;
pub mod pack;
pub mod pktline;

pub use bare_repo::{init_bare_repo, list_bare_repos, validate_bare_repo};
pub use command::{split_command_line, GitCommand, Service};
pub use pack::{GitBinary, PackError, PackIo, PackService};
