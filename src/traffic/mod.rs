// Admission control
pub mod limiter;

// Retry and backoff decisions
pub mod retry;

pub use limiter::{ConcurrencyLimiter, PermitBody};
pub use retry::{RetryDecision, RetryPolicy};
