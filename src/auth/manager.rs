//! Auth Manager
//!
//! Routes requests to the provider of their domain and remembers which
//! client each request belongs to. Request ids come from a wrapping 32-bit
//! counter.

use std::collections::BTreeMap;
use std::sync::mpsc;

use tokio::time::Instant;
use tracing::debug;

use crate::auth::provider::Provider;
use crate::auth::remote::REQUEST_TIMEOUT;
use crate::auth::AuthError;
use crate::network::protocol::Role;

/// Receives `(req_id, challenge)`.
pub type RequestCallback = Box<dyn FnOnce(Result<(u32, String), AuthError>) + Send>;

/// Receives `(name, role)` for a correct answer.
pub type ConfirmCallback = Box<dyn FnOnce(Result<(String, Role), AuthError>) + Send>;

#[derive(Clone, Debug)]
struct Pending {
    cn: u32,
    domain: String,
    name: String,
    created: Instant,
}

/// Providers by domain plus the requests in flight.
#[derive(Default)]
pub struct AuthManager {
    providers: BTreeMap<String, Box<dyn Provider>>,
    pending: BTreeMap<u32, Pending>,
    next_id: u32,
}

impl AuthManager {
    /// No providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `domain` with `provider`, replacing any previous one.
    pub fn add_provider(&mut self, domain: &str, provider: Box<dyn Provider>) {
        self.providers.insert(domain.to_string(), provider);
    }

    /// True if a provider serves `domain`.
    pub fn has_domain(&self, domain: &str) -> bool {
        self.providers.contains_key(domain)
    }

    /// Requests in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Start authenticating `name` in `domain` for client `cn`.
    pub fn request_challenge(&mut self, cn: u32, domain: &str, name: &str, callback: RequestCallback) {
        if !self.providers.contains_key(domain) {
            callback(Err(AuthError::UnknownDomain(domain.to_string())));
            return;
        }
        let req_id = self.allocate_id();
        self.pending.insert(
            req_id,
            Pending {
                cn,
                domain: domain.to_string(),
                name: name.to_string(),
                created: Instant::now(),
            },
        );
        debug!(cn, domain, name, req_id, "auth challenge requested");
        if let Some(provider) = self.providers.get_mut(domain) {
            provider.generate_challenge(
                req_id,
                name,
                Box::new(move |result| callback(result.map(|chal| (req_id, chal)))),
            );
        }
    }

    /// Check `answer` to request `req_id`. The request must belong to `cn`
    /// and `domain`; it is cleared whatever the outcome.
    pub fn request_confirmation(
        &mut self,
        req_id: u32,
        cn: u32,
        domain: &str,
        answer: &str,
        callback: ConfirmCallback,
    ) {
        let owned = self
            .pending
            .get(&req_id)
            .map_or(false, |p| p.cn == cn && p.domain == domain);
        if !owned {
            callback(Err(AuthError::NotFound(req_id)));
            return;
        }
        let Some(request) = self.pending.remove(&req_id) else {
            callback(Err(AuthError::NotFound(req_id)));
            return;
        };
        let Some(provider) = self.providers.get_mut(&request.domain) else {
            callback(Err(AuthError::UnknownDomain(request.domain)));
            return;
        };
        let name = request.name;
        provider.confirm_answer(
            req_id,
            answer,
            Box::new(move |result| callback(result.map(|role| (name, role)))),
        );
    }

    /// Synchronous `request_challenge` for providers that answer at once.
    /// Returns `(challenge, req_id)`.
    pub fn generate_challenge(&mut self, cn: u32, domain: &str, name: &str) -> Result<(String, u32), AuthError> {
        let (tx, rx) = mpsc::channel();
        self.request_challenge(
            cn,
            domain,
            name,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        match rx.try_recv() {
            Ok(result) => result.map(|(req_id, chal)| (chal, req_id)),
            Err(_) => Err(AuthError::Deferred),
        }
    }

    /// Synchronous `request_confirmation`. Returns `(ok, name, role)`;
    /// `(false, "", Role::None)` on any failure.
    pub fn check_answer(&mut self, req_id: u32, cn: u32, domain: &str, answer: &str) -> (bool, String, Role) {
        let (tx, rx) = mpsc::channel();
        self.request_confirmation(
            req_id,
            cn,
            domain,
            answer,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        match rx.try_recv() {
            Ok(Ok((name, role))) => (true, name, role),
            _ => (false, String::new(), Role::None),
        }
    }

    /// Drop every request of client `cn`.
    pub fn clear_client(&mut self, cn: u32) {
        let ids: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.cn == cn)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if let Some(p) = self.pending.remove(&id) {
                if let Some(provider) = self.providers.get_mut(&p.domain) {
                    provider.cancel(id);
                }
            }
        }
    }

    /// Expire requests older than the request timeout.
    pub fn sweep(&mut self, now: Instant) {
        for provider in self.providers.values_mut() {
            provider.sweep(now);
        }
        self.pending
            .retain(|_, p| now.duration_since(p.created) <= REQUEST_TIMEOUT);
    }

    /// The link behind `domain` dropped: fail its requests in flight.
    pub fn connection_lost(&mut self, domain: &str) {
        if let Some(provider) = self.providers.get_mut(domain) {
            provider.connection_lost();
        }
        self.pending.retain(|_, p| p.domain != domain);
    }

    /// Offer a master line to the provider of `domain`.
    pub fn handle_line(&mut self, domain: &str, line: &str) -> bool {
        self.providers
            .get_mut(domain)
            .map_or(false, |p| p.handle_line(line))
    }
}
