//! HTTP boundary: throttle middleware, upstream forwarding and the server.

mod client;
mod middleware;
mod proxy;
mod server;

pub use client::{client_id, route_category, LOOPBACK_CLIENT_ID};
pub use middleware::{
    throttle_requests, throttled, BoundaryState, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use proxy::{forward, Upstream};
pub use server::{router, GatewayServer};
