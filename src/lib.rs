//! Tally - Per-key Fixed-Window Rate Limiting
//!
//! This crate implements an in-process rate limiter that admits or rejects
//! requests per key (user id, IP address, ...) using fixed counting windows.
//! Expired per-key state is evicted by a background reaper task so memory
//! stays bounded by the set of recently active keys.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, TallyError};
pub use ratelimit::{Limiter, Policy, PolicySet, ReaperState, TimeUnit, WindowState};
