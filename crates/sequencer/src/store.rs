//! Storage primitives the allocator is built on
//!
//! Implementations must enforce two uniqueness constraints atomically:
//! `(tenant_id, resource_class, sequential_id)` across every row, soft-deleted ones
//! included, and `(tenant_id, resource_class, name_key)` across live rows. The first
//! is what makes concurrent allocation safe; without it the allocator can only offer
//! best-effort uniqueness.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::types::{AllocatedRecord, DisplayName, ResourceClass, SequentialId, TenantId};

/// How a record is removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the row entirely
    #[default]
    Hard,
    /// Stamp `deleted_at` and release the name; the sequential id stays reserved
    Soft,
}

#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Highest sequential id ever issued for the pair, 0 if none.
    ///
    /// Covers the counter high-water mark and every row including soft-deleted ones.
    /// Rows with corrupt ids are ignored.
    async fn query_max_sequential_id(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
    ) -> Result<u64, StoreError>;

    /// Whether a live record in the scope already carries this name, ignoring case
    async fn exists_by_name_case_insensitive(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        name: &DisplayName,
        exclude: Option<SequentialId>,
    ) -> Result<bool, StoreError>;

    /// Insert a record and raise the counter in one atomic unit.
    ///
    /// Fails with `StoreError::UniquenessViolation` when either constraint is hit.
    async fn insert_if_unique(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        name: &DisplayName,
        payload: &Value,
    ) -> Result<AllocatedRecord, StoreError>;

    async fn find_by_sequential_id(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
    ) -> Result<Option<AllocatedRecord>, StoreError>;

    /// Live records ordered by sequential id
    async fn list_live(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
    ) -> Result<Vec<AllocatedRecord>, StoreError>;

    /// Change the display name of a live record. `Ok(None)` if there is no such record.
    async fn rename(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        name: &DisplayName,
    ) -> Result<Option<AllocatedRecord>, StoreError>;

    /// Returns `false` if there was no live record to delete
    async fn delete(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        mode: DeleteMode,
    ) -> Result<bool, StoreError>;
}
