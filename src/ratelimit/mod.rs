//! Window limiting against a shared counting store.

mod identity;
mod limiter;
mod memory;
mod redis_store;
mod store;
mod window;

pub use identity::ClientIdentity;
pub use limiter::WindowLimiter;
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{CountingStore, StoreError, WindowSnapshot};
pub use window::{ConsumptionResult, WindowKind, WindowSpec};
