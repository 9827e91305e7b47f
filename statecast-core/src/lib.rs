pub mod models;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod bootstrap;

pub use config::Config;
pub use error::{Error, Result};
pub use cache::StateCache;
pub use models::{Event, StateRecord};
