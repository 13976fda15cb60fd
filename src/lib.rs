//! Tollgate - Per-Key Token Bucket Rate Limiting
//!
//! This crate decides, for a stream of admission checks identified by an
//! arbitrary string key, whether each check fits under a configured rate.
//! Buckets refill lazily at check time, and a background sweep evicts keys
//! that have gone idle so churn-heavy key spaces do not grow without bound.

pub mod config;
pub mod error;
pub mod ratelimit;
