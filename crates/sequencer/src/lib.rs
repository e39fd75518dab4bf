//! Tenant-scoped sequential id allocation
//!
//! This crate provides:
//! - `SequentialAllocator`: hands out human-facing ids (1, 2, 3, ...) per tenant and
//!   resource class, safe under concurrent creation
//! - `SequenceStore`: the storage primitives the allocator relies on
//! - `SqlStore`: Sea-ORM implementation with unique indexes (SQLite, PostgreSQL, MySQL/TiDB)
//! - `MemoryStore`: in-process document store with fault injection
//!
//! Can be used as a library or through the `seqctl` operator binary

pub mod allocator;
mod backoff;
pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use allocator::SequentialAllocator;
pub use config::{AllocatorConfig, DatabaseConfig};
pub use database::SqlStore;
pub use error::{AllocatorError, Result, StoreError, UniqueConstraint};
pub use memory::MemoryStore;
pub use store::{DeleteMode, SequenceStore};
pub use types::{
    AllocatedRecord, DisplayName, NewRecord, ResourceClass, SequentialId, TenantId,
    MAX_SAFE_SEQUENTIAL_ID,
};
