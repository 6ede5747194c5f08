//! Gatekeeper - Distributed Rate Limiting for HTTP Services
//!
//! This crate decides whether an incoming request is admitted or rejected
//! under per-route policies, counting usage per client address and per
//! authenticated identity in a shared counter store (Redis), and produces
//! the `X-Rate-Limit-*` quota headers clients use to pace themselves.

pub mod config;
pub mod error;
pub mod ratelimit;
