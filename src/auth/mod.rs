//! Authentication
//!
//! Challenge/response authentication against identity providers, one per
//! domain. Providers answer through callbacks so that local (immediate)
//! and remote (master server) providers look the same to the server.
//!
//! ## Module Structure
//!
//! - `crypto`: P-192 keys, challenges, answer comparison
//! - `provider`: Provider contract and callback types
//! - `local`: In-memory user database
//! - `remote`: Master server provider
//! - `manager`: Request ids, pending requests, domain routing

pub mod crypto;
pub mod local;
pub mod manager;
pub mod provider;
pub mod remote;

use thiserror::Error;

pub use crypto::{CryptoError, KeyPair};
pub use local::{LocalProvider, User};
pub use manager::AuthManager;
pub use provider::{AnswerCallback, ChallengeCallback, Provider};
pub use remote::RemoteProvider;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No provider serves the domain.
    #[error("unknown auth domain '{0}'")]
    UnknownDomain(String),

    /// Provider does not know the user.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// User already registered.
    #[error("user '{0}' already exists")]
    DuplicateUser(String),

    /// No pending request with this id for the caller.
    #[error("no pending auth request {0}")]
    NotFound(u32),

    /// Answer did not match.
    #[error("wrong answer")]
    WrongAnswer,

    /// Provider rejected the request.
    #[error("authentication denied")]
    Denied,

    /// Provider did not answer in time.
    #[error("authentication timed out")]
    Timeout,

    /// Provider cannot be reached.
    #[error("auth provider unavailable")]
    Unavailable,

    /// Provider answers asynchronously; use the callback API.
    #[error("auth provider is asynchronous")]
    Deferred,

    /// Key problem.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Users file unreadable.
    #[error("cannot read users file: {0}")]
    Io(#[from] std::io::Error),

    /// Users file malformed.
    #[error("invalid users file: {0}")]
    Json(#[from] serde_json::Error),
}
