//! Live client surface: connection tracking, outbound batching, inbound
//! message dispatch and the HTTP/WebSocket server.

pub mod batcher;
pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod rate_limit;
mod routes;
mod server;
mod socket;
mod state;

pub use batcher::{MessageBatcher, Priority};
pub use connection::{ConnectionInfo, ConnectionRegistry};
pub use handlers::{HandlerRegistry, InboundContext, MessageHandler};
pub use protocol::{BatchFrame, InboundMessage, ServerResponse};
pub use rate_limit::InboundRateLimiter;
pub use server::{spawn_event_forwarder, spawn_idle_reaper, GatewayServer};
pub use state::AppState;
