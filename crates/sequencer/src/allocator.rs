//! Tenant-scoped sequential id allocation
//!
//! The next id is derived from the highest id ever issued for `(tenant, resource class)`
//! and written under the store's uniqueness constraint. Nothing is held between the read
//! and the write, so concurrent callers can pick the same candidate; the loser sees a
//! `SequentialId` violation and starts over after a jittered backoff. No per-tenant state
//! is kept in memory between calls.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::AllocatorConfig;
use crate::error::{AllocatorError, Result, StoreError, UniqueConstraint};
use crate::store::{DeleteMode, SequenceStore};
use crate::types::{AllocatedRecord, DisplayName, NewRecord, ResourceClass, SequentialId, TenantId};

pub struct SequentialAllocator<S> {
    store: Arc<S>,
    config: AllocatorConfig,
}

impl<S: SequenceStore> SequentialAllocator<S> {
    pub fn new(store: Arc<S>, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn with_default_config(store: Arc<S>) -> Self {
        Self {
            store,
            config: AllocatorConfig::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Assign the next sequential id for `(tenant, resource_class)` and persist a record with it.
    ///
    /// `InvalidTenant`, `InvalidResourceClass`, `InvalidDisplayName` and `DuplicateName` are
    /// terminal. Sequence conflicts are retried internally; once the budget is spent the call
    /// fails with `AllocationExhausted`. Storage errors are returned unchanged.
    pub async fn allocate_and_create(
        &self,
        tenant: &str,
        resource_class: &str,
        fields: NewRecord,
    ) -> Result<AllocatedRecord> {
        let tenant = TenantId::parse(tenant)?;
        let class = ResourceClass::parse(resource_class)?;
        let name = DisplayName::parse(&fields.display_name)?;

        let mut backoff = Backoff::new(&self.config);
        loop {
            let attempt = backoff.begin_attempt();
            let candidate = self.next_candidate(&tenant, &class).await?;
            debug!(
                "Allocating {} #{} for tenant {} (attempt {}/{})",
                class, candidate, tenant, attempt, self.config.max_attempts
            );

            let name_taken = self
                .call(
                    "exists_by_name_case_insensitive",
                    self.store.exists_by_name_case_insensitive(&tenant, &class, &name, None),
                )
                .await?;
            if name_taken {
                return Err(duplicate_name(&tenant, &class, &name));
            }

            let inserted = self
                .call(
                    "insert_if_unique",
                    self.store
                        .insert_if_unique(&tenant, &class, candidate, &name, &fields.payload),
                )
                .await;

            match inserted {
                Ok(record) => {
                    info!(
                        "Allocated {} #{} ({}) for tenant {}",
                        class, record.sequential_id, record.display_name, tenant
                    );
                    return Ok(record);
                }
                Err(StoreError::UniquenessViolation {
                    constraint: UniqueConstraint::DisplayName,
                }) => {
                    return Err(duplicate_name(&tenant, &class, &name));
                }
                Err(StoreError::UniquenessViolation {
                    constraint: UniqueConstraint::SequentialId,
                }) => {
                    warn!(
                        "Sequence conflict on {} #{} for tenant {}, retrying ({}/{})",
                        class, candidate, tenant, attempt, self.config.max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }

            if !backoff.pause().await {
                error!(
                    "Gave up allocating {} for tenant {} after {} attempts in {:?}",
                    class,
                    tenant,
                    backoff.attempts(),
                    backoff.elapsed()
                );
                return Err(AllocatorError::AllocationExhausted {
                    attempts: backoff.attempts(),
                    elapsed: backoff.elapsed(),
                });
            }
        }
    }

    /// Candidate the next allocation would try. Advisory only: nothing is reserved.
    pub async fn peek_next(&self, tenant: &str, resource_class: &str) -> Result<SequentialId> {
        let tenant = TenantId::parse(tenant)?;
        let class = ResourceClass::parse(resource_class)?;
        self.next_candidate(&tenant, &class).await
    }

    pub async fn get(
        &self,
        tenant: &str,
        resource_class: &str,
        sequential_id: u64,
    ) -> Result<AllocatedRecord> {
        let tenant = TenantId::parse(tenant)?;
        let class = ResourceClass::parse(resource_class)?;
        let Some(id) = SequentialId::new(sequential_id) else {
            return Err(not_found(&tenant, &class, sequential_id));
        };

        self.call(
            "find_by_sequential_id",
            self.store.find_by_sequential_id(&tenant, &class, id),
        )
        .await?
        .ok_or_else(|| not_found(&tenant, &class, sequential_id))
    }

    /// Live records ordered by sequential id
    pub async fn list(&self, tenant: &str, resource_class: &str) -> Result<Vec<AllocatedRecord>> {
        let tenant = TenantId::parse(tenant)?;
        let class = ResourceClass::parse(resource_class)?;
        Ok(self
            .call("list_live", self.store.list_live(&tenant, &class))
            .await?)
    }

    /// Change a record's display name; its sequential id is untouched
    pub async fn rename(
        &self,
        tenant: &str,
        resource_class: &str,
        sequential_id: u64,
        new_name: &str,
    ) -> Result<AllocatedRecord> {
        let tenant = TenantId::parse(tenant)?;
        let class = ResourceClass::parse(resource_class)?;
        let name = DisplayName::parse(new_name)?;
        let Some(id) = SequentialId::new(sequential_id) else {
            return Err(not_found(&tenant, &class, sequential_id));
        };

        let name_taken = self
            .call(
                "exists_by_name_case_insensitive",
                self.store
                    .exists_by_name_case_insensitive(&tenant, &class, &name, Some(id)),
            )
            .await?;
        if name_taken {
            return Err(duplicate_name(&tenant, &class, &name));
        }

        match self
            .call("rename", self.store.rename(&tenant, &class, id, &name))
            .await
        {
            Ok(Some(record)) => {
                info!("Renamed {} #{} to {} for tenant {}", class, id, name, tenant);
                Ok(record)
            }
            Ok(None) => Err(not_found(&tenant, &class, sequential_id)),
            Err(StoreError::UniquenessViolation { .. }) => Err(duplicate_name(&tenant, &class, &name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a live record. Its id is never handed out again.
    pub async fn remove(
        &self,
        tenant: &str,
        resource_class: &str,
        sequential_id: u64,
        mode: DeleteMode,
    ) -> Result<()> {
        let tenant = TenantId::parse(tenant)?;
        let class = ResourceClass::parse(resource_class)?;
        let Some(id) = SequentialId::new(sequential_id) else {
            return Err(not_found(&tenant, &class, sequential_id));
        };

        let deleted = self
            .call("delete", self.store.delete(&tenant, &class, id, mode))
            .await?;
        if !deleted {
            return Err(not_found(&tenant, &class, sequential_id));
        }

        info!("Removed {} #{} for tenant {} ({:?})", class, id, tenant, mode);
        Ok(())
    }

    async fn next_candidate(&self, tenant: &TenantId, class: &ResourceClass) -> Result<SequentialId> {
        let max = self
            .call(
                "query_max_sequential_id",
                self.store.query_max_sequential_id(tenant, class),
            )
            .await?;

        SequentialId::next_after(max).ok_or_else(|| AllocatorError::SequenceOverflow {
            tenant: tenant.to_string(),
            resource_class: class.to_string(),
        })
    }

    /// Run one storage call under the per-call timeout
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout {
                operation,
                after: self.config.call_timeout,
            })?
    }
}

fn duplicate_name(tenant: &TenantId, class: &ResourceClass, name: &DisplayName) -> AllocatorError {
    AllocatorError::DuplicateName {
        tenant: tenant.to_string(),
        resource_class: class.to_string(),
        name: name.to_string(),
    }
}

fn not_found(tenant: &TenantId, class: &ResourceClass, sequential_id: u64) -> AllocatorError {
    AllocatorError::NotFound {
        tenant: tenant.to_string(),
        resource_class: class.to_string(),
        sequential_id,
    }
}
