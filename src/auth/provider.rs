//! Provider Contract

use tokio::time::Instant;

use crate::auth::AuthError;
use crate::network::protocol::Role;

/// Receives the encoded challenge point.
pub type ChallengeCallback = Box<dyn FnOnce(Result<String, AuthError>) + Send>;

/// Receives the role granted for a correct answer.
pub type AnswerCallback = Box<dyn FnOnce(Result<Role, AuthError>) + Send>;

/// An identity provider for one domain.
///
/// Every callback handed to a provider is called exactly once: with a
/// result, an error, or a timeout.
pub trait Provider: Send {
    /// Challenge user `name` for request `req_id`.
    fn generate_challenge(&mut self, req_id: u32, name: &str, callback: ChallengeCallback);

    /// Check the answer to the challenge of request `req_id`.
    fn confirm_answer(&mut self, req_id: u32, answer: &str, callback: AnswerCallback);

    /// Drop request `req_id`. A callback still waiting fails with
    /// `AuthError::NotFound`.
    fn cancel(&mut self, _req_id: u32) {}

    /// Expire stale requests.
    fn sweep(&mut self, _now: Instant) {}

    /// The upstream connection dropped. Waiting callbacks fail with
    /// `AuthError::Unavailable`.
    fn connection_lost(&mut self) {}

    /// Offer a line from the master server. True if consumed.
    fn handle_line(&mut self, _line: &str) -> bool {
        false
    }
}
