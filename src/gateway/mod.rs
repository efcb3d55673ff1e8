//! Broker HTTP surface: request gate, tickets, tools and server

pub mod auth;
mod router;
mod server;
pub mod tickets;
pub mod tools;

pub use auth::{RequestGate, RequestGuard, Verdict, auth_middleware};
pub use router::{AppState, create_router};
pub use server::Broker;
pub use tickets::TicketManager;
pub use tools::{AUTH_SENTINEL, CalendarTools, ToolOutcome};
