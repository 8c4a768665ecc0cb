//! Turnstile - Adaptive Request Throttling
//!
//! This crate implements an in-process rate limiting engine for public
//! endpoints. Clients are identified by origin address and user agent,
//! counted in fixed windows, and pushed into exponentially growing blocks
//! when they keep exceeding their budget. A supervised background sweep
//! keeps memory bounded.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
