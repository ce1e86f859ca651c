//! Master Server Provider
//!
//! Forwards challenges and answers to the master server as text lines and
//! completes the callbacks when the replies come back:
//!
//! ```text
//!   reqauth <id> <name>      ──▶   chalauth <id> <challenge> | failauth <id>
//!   confauth <id> <answer>   ──▶   succauth <id>             | failauth <id>
//! ```
//!
//! Requests the master leaves unanswered for 30 s fail with a timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::provider::{AnswerCallback, ChallengeCallback, Provider};
use crate::auth::AuthError;
use crate::network::protocol::Role;

/// Requests idle longer than this fail.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

enum Waiting {
    Challenge(ChallengeCallback),
    Answer(AnswerCallback),
}

impl Waiting {
    fn fail(self, err: AuthError) {
        match self {
            Waiting::Challenge(cb) => cb(Err(err)),
            Waiting::Answer(cb) => cb(Err(err)),
        }
    }
}

/// Provider talking to a master server.
#[derive(Default)]
pub struct RemoteProvider {
    outbound: Option<UnboundedSender<String>>,
    waiting: BTreeMap<u32, (Waiting, Instant)>,
}

impl RemoteProvider {
    /// Provider that is offline until `connect` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `outbound` for requests from now on.
    pub fn connect(&mut self, outbound: UnboundedSender<String>) {
        self.outbound = Some(outbound);
    }

    /// The master connection is gone: fail everything in flight.
    pub fn disconnect(&mut self) {
        self.outbound = None;
        for (_, (w, _)) in std::mem::take(&mut self.waiting) {
            w.fail(AuthError::Unavailable);
        }
    }

    /// True while a master connection is available.
    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    /// Requests awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.waiting.len()
    }

    fn send(&self, line: String) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }
}

impl Provider for RemoteProvider {
    fn generate_challenge(&mut self, req_id: u32, name: &str, callback: ChallengeCallback) {
        if !self.send(format!("reqauth {} {}", req_id, name)) {
            callback(Err(AuthError::Unavailable));
            return;
        }
        if let Some((old, _)) = self
            .waiting
            .insert(req_id, (Waiting::Challenge(callback), Instant::now()))
        {
            old.fail(AuthError::NotFound(req_id));
        }
    }

    fn confirm_answer(&mut self, req_id: u32, answer: &str, callback: AnswerCallback) {
        if !self.send(format!("confauth {} {}", req_id, answer)) {
            callback(Err(AuthError::Unavailable));
            return;
        }
        if let Some((old, _)) = self
            .waiting
            .insert(req_id, (Waiting::Answer(callback), Instant::now()))
        {
            old.fail(AuthError::NotFound(req_id));
        }
    }

    fn cancel(&mut self, req_id: u32) {
        if let Some((w, _)) = self.waiting.remove(&req_id) {
            w.fail(AuthError::NotFound(req_id));
        }
    }

    fn connection_lost(&mut self) {
        for (_, (w, _)) in std::mem::take(&mut self.waiting) {
            w.fail(AuthError::Unavailable);
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .waiting
            .iter()
            .filter(|(_, (_, since))| now.duration_since(*since) > REQUEST_TIMEOUT)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some((w, _)) = self.waiting.remove(&id) {
                debug!(req_id = id, "remote auth request timed out");
                w.fail(AuthError::Timeout);
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        let (Some(cmd), Some(id)) = (words.next(), words.next()) else {
            return false;
        };
        if !matches!(cmd, "chalauth" | "succauth" | "failauth") {
            return false;
        }
        let Ok(req_id) = id.parse::<u32>() else {
            warn!(line, "malformed auth reply from master");
            return true;
        };
        let Some((waiting, _)) = self.waiting.remove(&req_id) else {
            debug!(req_id, "auth reply for unknown request");
            return true;
        };
        match (cmd, waiting) {
            ("chalauth", Waiting::Challenge(cb)) => match words.next() {
                Some(challenge) => cb(Ok(challenge.to_string())),
                None => cb(Err(AuthError::Denied)),
            },
            ("succauth", Waiting::Answer(cb)) => cb(Ok(Role::Auth)),
            (_, w) => w.fail(AuthError::Denied),
        }
        true
    }
}
