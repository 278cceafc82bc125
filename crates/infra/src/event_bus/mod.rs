//! Infrastructure-backed `EventBus` transports.
//!
//! The bus abstraction and the in-memory transport live in `warden-events`.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
