//! Resilience layers callers opt into: circuit breaking, bounded channels
//! with overflow strategies, timeout protection, and the dead-letter queue.

pub mod bounded_channel;
pub mod circuit_breaker;
pub mod dlq;
pub mod timeout;

pub use bounded_channel::{
    BoundedChannel, BoundedChannelManager, ChannelOptions, ChannelStats, FullMode,
    OverflowStrategy,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use timeout::{AdaptiveTimeoutStats, OperationStats, TimeoutProtectedMachine};
