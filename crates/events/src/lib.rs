//! `warden-events`: pub/sub mechanics and the invalidation event model.

pub mod bus;
pub mod in_memory_bus;
pub mod invalidation;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use invalidation::{ALL_CHANNELS, InvalidationEvent, InvalidationType};
