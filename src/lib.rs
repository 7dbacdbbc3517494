//! Ratewall - per-identity HTTP rate limiting
//!
//! Requests are limited per caller IP or per API token using a fixed
//! one-second window. An identity that exceeds its threshold is blocked
//! outright for a configured duration. Counters and blocks live in a shared
//! store (Redis, or an in-process map) so any number of instances enforce
//! one budget.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
