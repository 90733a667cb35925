//! Client-side query cache, retry and rate limiting.

pub mod client;
pub mod rate_limiter;
pub mod retry;

pub use client::{QueryClient, QueryKey, QueryOptions, QueryResult, QueryStatus, RefetchHandle};
pub use rate_limiter::{RateLimited, RateLimiter};
pub use retry::RetryPolicy;
