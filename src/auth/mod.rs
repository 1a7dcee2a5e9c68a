//! Authentication and authorisation.
//!
//! Access levels, the transport-independent client key, and the credential
//! evaluator that turns a (repository, key) pair into an access level via
//! the backend policy.

pub mod access;
pub mod evaluator;
pub mod key;

pub use access::AccessLevel;
pub use evaluator::CredentialEvaluator;
pub use key::ClientKey;
