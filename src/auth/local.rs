//! Local User Database
//!
//! In-memory users of one domain, each with a P-192 public key and a role.
//! Challenges are answered immediately.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::auth::crypto::{self, PublicKey};
use crate::auth::provider::{AnswerCallback, ChallengeCallback, Provider};
use crate::auth::remote::REQUEST_TIMEOUT;
use crate::auth::AuthError;
use crate::network::protocol::Role;

/// A user record as stored in the users file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name.
    pub name: String,
    /// Auth domain; empty for the primary domain.
    #[serde(default)]
    pub domain: String,
    /// Encoded public key.
    pub public_key: String,
    /// Role granted on success.
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Auth
}

/// Read a users file.
pub fn load_users(path: &Path) -> Result<Vec<User>, AuthError> {
    let text = std::fs::read_to_string(path)?;
    let users: Vec<User> = serde_json::from_str(&text)?;
    info!(count = users.len(), path = %path.display(), "loaded users");
    Ok(users)
}

struct Pending {
    solution: String,
    role: Role,
    created: Instant,
}

/// Provider backed by an in-memory user table.
#[derive(Default)]
pub struct LocalProvider {
    users: BTreeMap<String, (PublicKey, Role)>,
    pending: BTreeMap<u32, Pending>,
}

impl LocalProvider {
    /// No users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user.
    pub fn add_user(&mut self, name: &str, public_key: &str, role: Role) -> Result<(), AuthError> {
        if self.users.contains_key(name) {
            return Err(AuthError::DuplicateUser(name.to_string()));
        }
        let key = crypto::parse_point(public_key)?;
        self.users.insert(name.to_string(), (key, role));
        debug!(name, %role, "user added");
        Ok(())
    }

    /// Remove a user. True if it existed.
    pub fn delete_user(&mut self, name: &str) -> bool {
        self.users.remove(name).is_some()
    }

    /// True if `name` is registered.
    pub fn has_user(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    /// Number of users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn challenge(&mut self, req_id: u32, name: &str) -> Result<String, AuthError> {
        let (key, role) = self
            .users
            .get(name)
            .ok_or_else(|| AuthError::UnknownUser(name.to_string()))?;
        let ch = crypto::generate_challenge(key)?;
        self.pending.insert(
            req_id,
            Pending {
                solution: ch.solution,
                role: *role,
                created: Instant::now(),
            },
        );
        Ok(ch.challenge)
    }
}

impl Provider for LocalProvider {
    fn generate_challenge(&mut self, req_id: u32, name: &str, callback: ChallengeCallback) {
        callback(self.challenge(req_id, name));
    }

    fn confirm_answer(&mut self, req_id: u32, answer: &str, callback: AnswerCallback) {
        let result = match self.pending.remove(&req_id) {
            Some(p) if crypto::answers_match(&p.solution, answer) => Ok(p.role),
            Some(_) => Err(AuthError::WrongAnswer),
            None => Err(AuthError::NotFound(req_id)),
        };
        callback(result);
    }

    fn cancel(&mut self, req_id: u32) {
        self.pending.remove(&req_id);
    }

    fn sweep(&mut self, now: Instant) {
        self.pending
            .retain(|_, p| now.duration_since(p.created) <= REQUEST_TIMEOUT);
    }
}
