//! Request gate for the broker's HTTP surface
//!
//! Every inbound request runs through an ordered list of guards before any
//! handler sees it:
//! - the OAuth callback is exempt (its state nonce is the anti-forgery check)
//! - `/auth` needs a per-user ticket in the query string
//! - configured public paths bypass authentication
//! - everything else needs `Authorization: Bearer <service secret>`
//!
//! The first guard with an opinion decides. A request no guard accepts is
//! rejected.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::tickets::TicketManager;

/// Path of the consent initiation endpoint
pub const AUTH_PATH: &str = "/auth";

/// Outcome of a single guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not this guard's concern; ask the next one
    Next,
    /// Let the request through
    Allow,
    /// Reject with 401 and the given reason
    Reject(&'static str),
}

/// One step of the request gate
pub trait RequestGuard: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Inspect a request
    fn check(&self, request: &Request<Body>) -> Verdict;
}

/// Lets the OAuth callback through untouched
pub struct CallbackExemption {
    callback_path: String,
}

impl CallbackExemption {
    /// Exempt exactly `callback_path`
    pub fn new(callback_path: impl Into<String>) -> Self {
        Self {
            callback_path: callback_path.into(),
        }
    }
}

impl RequestGuard for CallbackExemption {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn check(&self, request: &Request<Body>) -> Verdict {
        if request.uri().path() == self.callback_path {
            Verdict::Allow
        } else {
            Verdict::Next
        }
    }
}

/// Checks `/auth?userid=..&token=..` against the ticket issued for that user
pub struct TicketGuard {
    tickets: Arc<TicketManager>,
}

impl TicketGuard {
    /// Guard backed by the given ticket table
    pub fn new(tickets: Arc<TicketManager>) -> Self {
        Self { tickets }
    }
}

impl RequestGuard for TicketGuard {
    fn name(&self) -> &'static str {
        "ticket"
    }

    fn check(&self, request: &Request<Body>) -> Verdict {
        if request.uri().path() != AUTH_PATH {
            return Verdict::Next;
        }

        let mut user_id = None;
        let mut token = None;
        if let Some(query) = request.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "userid" => user_id = Some(value.into_owned()),
                    "token" => token = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        let (Some(user_id), Some(token)) = (user_id, token) else {
            return Verdict::Reject("Missing userid or token");
        };
        if user_id.is_empty() || token.is_empty() {
            return Verdict::Reject("Missing userid or token");
        }

        if self.tickets.validate(&user_id, &token) {
            debug!(user_id = %user_id, "Authorization ticket accepted");
            Verdict::Allow
        } else {
            Verdict::Reject("Invalid authorization ticket")
        }
    }
}

/// Lets configured public paths through (prefix match)
pub struct PublicPaths {
    paths: Vec<String>,
}

impl PublicPaths {
    /// Guard for the given path prefixes
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl RequestGuard for PublicPaths {
    fn name(&self) -> &'static str {
        "public"
    }

    fn check(&self, request: &Request<Body>) -> Verdict {
        let path = request.uri().path();
        if self.paths.iter().any(|p| path.starts_with(p.as_str())) {
            Verdict::Allow
        } else {
            Verdict::Next
        }
    }
}

/// Requires the process-wide service secret as a bearer token
pub struct ServiceBearerGuard {
    secret: String,
}

impl ServiceBearerGuard {
    /// Guard accepting exactly `secret`
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl RequestGuard for ServiceBearerGuard {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn check(&self, request: &Request<Body>) -> Verdict {
        let Some(value) = request.headers().get(header::AUTHORIZATION) else {
            return Verdict::Reject("Missing Authorization Header");
        };

        let token = value
            .to_str()
            .ok()
            .and_then(|v| v.split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            return Verdict::Reject("Invalid Authorization Header");
        };

        // An empty secret must never match anything.
        if !self.secret.is_empty() && bool::from(self.secret.as_bytes().ct_eq(token.as_bytes())) {
            Verdict::Allow
        } else {
            Verdict::Reject("Unauthorized")
        }
    }
}

/// Ordered guard chain
pub struct RequestGate {
    guards: Vec<Box<dyn RequestGuard>>,
}

impl RequestGate {
    /// Gate from an explicit guard list
    pub fn new(guards: Vec<Box<dyn RequestGuard>>) -> Self {
        Self { guards }
    }

    /// The broker's gate: callback exemption, ticket check on `/auth`,
    /// public paths, then the service bearer secret
    pub fn standard(
        service_secret: impl Into<String>,
        public_paths: Vec<String>,
        callback_path: impl Into<String>,
        tickets: Arc<TicketManager>,
    ) -> Self {
        Self::new(vec![
            Box::new(CallbackExemption::new(callback_path)),
            Box::new(TicketGuard::new(tickets)),
            Box::new(PublicPaths::new(public_paths)),
            Box::new(ServiceBearerGuard::new(service_secret)),
        ])
    }

    /// Run the guards in order
    pub fn evaluate(&self, request: &Request<Body>) -> Verdict {
        for guard in &self.guards {
            match guard.check(request) {
                Verdict::Next => {}
                Verdict::Reject(reason) => {
                    warn!(
                        guard = guard.name(),
                        path = %request.uri().path(),
                        reason,
                        "Request rejected"
                    );
                    return Verdict::Reject(reason);
                }
                Verdict::Allow => {
                    debug!(guard = guard.name(), path = %request.uri().path(), "Request allowed");
                    return Verdict::Allow;
                }
            }
        }
        warn!(path = %request.uri().path(), "No guard accepted request");
        Verdict::Reject("Unauthorized")
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<RequestGate>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match gate.evaluate(&request) {
        Verdict::Allow => next.run(request).await,
        Verdict::Reject(reason) => unauthorized_response(reason),
        Verdict::Next => unauthorized_response("Unauthorized"),
    }
}

/// Create a 401 Unauthorized response with a plaintext reason
fn unauthorized_response(reason: &'static str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        reason,
    )
        .into_response()
}
