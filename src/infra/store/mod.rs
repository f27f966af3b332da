//! Backing store adapters.

pub mod memory;

pub use memory::{CommitReceipt, MemoryStore, MemoryStoreManager, StoreConnection, Transaction};
