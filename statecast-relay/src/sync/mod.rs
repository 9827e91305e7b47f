// Module: sync

pub mod bridge;
pub mod bus;
pub mod events;
pub mod redis_pubsub;

pub use bridge::BusBridge;
pub use bus::{EventBus, MemoryBus};
pub use events::BusEnvelope;
pub use redis_pubsub::RedisBus;
