//! Infrastructure adapters for the backing store and task storage.

pub mod store;
pub mod task_store;

pub use store::{MemoryStore, MemoryStoreManager, StoreConnection, Transaction};
pub use task_store::{AnyTaskStore, InMemoryTaskStore, JsonlTaskStore};
