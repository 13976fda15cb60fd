//! Rate limiter trait for abstracting over limiter implementations.

/// Trait for rate limiter implementations.
///
/// Callers that only need admission decisions can depend on this trait
/// instead of a concrete limiter.
pub trait RateLimiter: Send + Sync {
    /// Check whether one request for `key` is allowed.
    ///
    /// Returns `false` when the request should be retried later.
    fn allow(&self, key: &str) -> bool;
}
