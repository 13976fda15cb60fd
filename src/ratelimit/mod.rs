//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod limiter;
mod sweeper;

pub use backend::RateLimiter;
pub use limiter::TokenBucketLimiter;
