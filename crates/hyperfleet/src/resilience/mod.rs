//! C2: timeout, retry-with-backoff-and-jitter, and a three-state circuit
//! breaker. Every outbound call in C4/C5/C7 is wrapped by these.
pub mod breaker;
pub mod retry;
pub mod timeout;

pub use breaker::{BreakerState, CircuitBreaker};
pub use retry::{RetryOptions, with_retry};
pub use timeout::with_timeout;
