//! MixerAI rate limiting.
//!
//! Fixed-window rate limits with escalating penalty blocks, stored either in
//! a shared REST key-value store or, when none is configured, in process
//! memory. On top of the core sit named policies with path classification
//! and a layered per-user / per-brand facade for content generation. Both
//! upper layers fail open when the store is unavailable.

pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod store;
