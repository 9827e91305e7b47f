pub mod batch;
pub mod connection;
pub mod connection_manager;
pub mod delivery;
pub mod error;
pub mod frames;
pub mod hooks;
pub mod liveness;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod sync;

pub use error::{Error, Result};
pub use connection::{ConnectionId, Outbound};
pub use connection_manager::{ConnectionGuard, ConnectionManager};
pub use hooks::{Authorizer, EventScorer, Hooks, Score, StaticTokenVerifier, TokenVerifier};
pub use relay::{ConnectionSession, FrameOutcome, Relay};
pub use sync::{BusBridge, EventBus, MemoryBus, RedisBus};
