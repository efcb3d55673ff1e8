//! Per-user authorization tickets
//!
//! A ticket is handed to the host inside the `[AUTH]` sentinel when a user
//! has no usable provider token. The end user then opens
//! `/auth?userid=<id>&token=<ticket>`, and the request gate checks the pair
//! here. One ticket per user; issuing again supersedes the previous one.
//! Validation does not consume the ticket.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::debug;

#[derive(Debug, Clone)]
struct Ticket {
    secret: String,
    issued_at: Instant,
}

/// In-memory ticket table keyed by user id
#[derive(Debug, Default)]
pub struct TicketManager {
    tickets: DashMap<String, Ticket>,
    ttl: Option<Duration>,
}

impl TicketManager {
    /// Create a manager. `ttl = None` keeps tickets until superseded.
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            tickets: DashMap::new(),
            ttl,
        }
    }

    /// Issue a new ticket for `user_id`, replacing any previous one
    pub fn issue(&self, user_id: &str) -> String {
        let bytes: [u8; 32] = rand::rng().random();
        let secret = hex::encode(bytes);
        self.tickets.insert(
            user_id.to_string(),
            Ticket {
                secret: secret.clone(),
                issued_at: Instant::now(),
            },
        );
        debug!(user_id = %user_id, "Issued authorization ticket");
        secret
    }

    /// Check a presented ticket against the one issued for `user_id`
    #[must_use]
    pub fn validate(&self, user_id: &str, secret: &str) -> bool {
        let Some(ticket) = self.tickets.get(user_id) else {
            return false;
        };

        if let Some(ttl) = self.ttl {
            if ticket.issued_at.elapsed() > ttl {
                return false;
            }
        }

        ticket.secret.as_bytes().ct_eq(secret.as_bytes()).into()
    }

    /// Number of live tickets
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Whether no tickets have been issued
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
