//! RuralGuru request throttle
//!
//! A fixed-window rate limiter for the RuralGuru marketplace. Counters live
//! in a shared store (Redis, or in-process memory for a single instance) and
//! an axum gateway applies the limits per client and route category before
//! forwarding traffic to the marketplace application.

pub mod config;
pub mod error;
pub mod http;
pub mod store;
pub mod throttle;
