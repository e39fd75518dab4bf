//! In-process document store
//!
//! Keeps raw `serde_json::Value` ids the way a schemaless collection would, so legacy
//! and corrupt documents can be seeded. Both uniqueness constraints are checked under a
//! single lock, which makes `insert_if_unique` atomic. Faults and latency can be
//! injected to exercise the allocator's retry and pass-through paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{StoreError, UniqueConstraint};
use crate::store::{DeleteMode, SequenceStore};
use crate::types::{
    max_valid_sequential_id, AllocatedRecord, DisplayName, ResourceClass, SequentialId, TenantId,
};

#[derive(Debug, Clone)]
struct Document {
    record_key: i64,
    tenant_id: TenantId,
    resource_class: ResourceClass,
    sequential_id: Value,
    display_name: String,
    /// Cleared on soft delete so the name can be reused
    name_key: Option<String>,
    payload: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    fn in_scope(&self, tenant: &TenantId, class: &ResourceClass) -> bool {
        &self.tenant_id == tenant && &self.resource_class == class
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    fn sequential_id(&self) -> Option<SequentialId> {
        SequentialId::from_raw(&self.sequential_id)
    }

    fn to_record(&self) -> Option<AllocatedRecord> {
        Some(AllocatedRecord {
            record_key: self.record_key,
            tenant_id: self.tenant_id.clone(),
            resource_class: self.resource_class.clone(),
            sequential_id: self.sequential_id()?,
            display_name: self.display_name.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    counters: HashMap<(TenantId, ResourceClass), u64>,
    next_record_key: i64,
}

impl Collection {
    fn allocate_record_key(&mut self) -> i64 {
        self.next_record_key += 1;
        self.next_record_key
    }

    fn name_taken(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        key: &str,
        exclude: Option<SequentialId>,
    ) -> bool {
        self.documents.iter().any(|doc| {
            doc.in_scope(tenant, class)
                && doc.is_live()
                && doc.name_key.as_deref() == Some(key)
                && (exclude.is_none() || doc.sequential_id() != exclude)
        })
    }
}

#[derive(Default)]
struct Faults {
    insert_violation: Option<UniqueConstraint>,
    unavailable: Option<String>,
    latency: Duration,
}

/// `SequenceStore` backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    collection: Mutex<Collection>,
    faults: Mutex<Faults>,
    insert_attempts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document with an arbitrary raw id, bypassing constraints and counters
    pub fn seed_raw(&self, tenant: &TenantId, class: &ResourceClass, sequential_id: Value, name: &str) {
        let now = Utc::now();
        let mut collection = self.collection.lock();
        let record_key = collection.allocate_record_key();
        collection.documents.push(Document {
            record_key,
            tenant_id: tenant.clone(),
            resource_class: class.clone(),
            sequential_id,
            display_name: name.to_string(),
            name_key: Some(name.trim().to_lowercase()),
            payload: Value::Null,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
    }

    /// Make every subsequent insert fail with the given violation
    pub fn fail_inserts_with(&self, constraint: UniqueConstraint) {
        self.faults.lock().insert_violation = Some(constraint);
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    pub fn fail_with_unavailable(&self, message: impl Into<String>) {
        self.faults.lock().unavailable = Some(message.into());
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = latency;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Number of `insert_if_unique` calls received, successful or not
    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// Number of documents in the scope, soft-deleted and corrupt ones included
    pub fn document_count(&self, tenant: &TenantId, class: &ResourceClass) -> usize {
        self.collection
            .lock()
            .documents
            .iter()
            .filter(|doc| doc.in_scope(tenant, class))
            .count()
    }

    /// Yield or sleep like a network round trip, then apply the outage fault if set
    async fn round_trip(&self) -> Result<(), StoreError> {
        let latency = self.faults.lock().latency;
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        match self.faults.lock().unavailable.clone() {
            Some(message) => Err(StoreError::Unavailable(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn query_max_sequential_id(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
    ) -> Result<u64, StoreError> {
        self.round_trip().await?;

        let collection = self.collection.lock();
        let counter = collection
            .counters
            .get(&(tenant.clone(), class.clone()))
            .copied()
            .unwrap_or(0);
        let stored = max_valid_sequential_id(
            collection
                .documents
                .iter()
                .filter(|doc| doc.in_scope(tenant, class))
                .map(|doc| &doc.sequential_id),
        );
        Ok(counter.max(stored))
    }

    async fn exists_by_name_case_insensitive(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        name: &DisplayName,
        exclude: Option<SequentialId>,
    ) -> Result<bool, StoreError> {
        self.round_trip().await?;
        Ok(self.collection.lock().name_taken(tenant, class, name.key(), exclude))
    }

    async fn insert_if_unique(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        name: &DisplayName,
        payload: &Value,
    ) -> Result<AllocatedRecord, StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        if let Some(constraint) = self.faults.lock().insert_violation {
            return Err(StoreError::UniquenessViolation { constraint });
        }

        let mut collection = self.collection.lock();

        let id_taken = collection
            .documents
            .iter()
            .any(|doc| doc.in_scope(tenant, class) && doc.sequential_id() == Some(sequential_id));
        if id_taken {
            return Err(StoreError::UniquenessViolation {
                constraint: UniqueConstraint::SequentialId,
            });
        }
        if collection.name_taken(tenant, class, name.key(), None) {
            return Err(StoreError::UniquenessViolation {
                constraint: UniqueConstraint::DisplayName,
            });
        }

        let now = Utc::now();
        let document = Document {
            record_key: collection.allocate_record_key(),
            tenant_id: tenant.clone(),
            resource_class: class.clone(),
            sequential_id: Value::from(sequential_id.get()),
            display_name: name.as_str().to_string(),
            name_key: Some(name.key().to_string()),
            payload: payload.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let record = document.to_record().ok_or_else(|| StoreError::CorruptRecord {
            record_key: document.record_key,
            message: "freshly inserted id is out of range".to_string(),
        })?;

        collection.documents.push(document);
        let counter = collection
            .counters
            .entry((tenant.clone(), class.clone()))
            .or_insert(0);
        *counter = (*counter).max(sequential_id.get());

        Ok(record)
    }

    async fn find_by_sequential_id(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
    ) -> Result<Option<AllocatedRecord>, StoreError> {
        self.round_trip().await?;

        Ok(self
            .collection
            .lock()
            .documents
            .iter()
            .find(|doc| {
                doc.in_scope(tenant, class)
                    && doc.is_live()
                    && doc.sequential_id() == Some(sequential_id)
            })
            .and_then(Document::to_record))
    }

    async fn list_live(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
    ) -> Result<Vec<AllocatedRecord>, StoreError> {
        self.round_trip().await?;

        let mut records: Vec<_> = self
            .collection
            .lock()
            .documents
            .iter()
            .filter(|doc| doc.in_scope(tenant, class) && doc.is_live())
            .filter_map(Document::to_record)
            .collect();
        records.sort_by_key(|record| record.sequential_id);
        Ok(records)
    }

    async fn rename(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        name: &DisplayName,
    ) -> Result<Option<AllocatedRecord>, StoreError> {
        self.round_trip().await?;

        let mut collection = self.collection.lock();
        if collection.name_taken(tenant, class, name.key(), Some(sequential_id)) {
            return Err(StoreError::UniquenessViolation {
                constraint: UniqueConstraint::DisplayName,
            });
        }

        let Some(doc) = collection.documents.iter_mut().find(|doc| {
            doc.in_scope(tenant, class) && doc.is_live() && doc.sequential_id() == Some(sequential_id)
        }) else {
            return Ok(None);
        };

        doc.display_name = name.as_str().to_string();
        doc.name_key = Some(name.key().to_string());
        doc.updated_at = Utc::now();
        Ok(doc.to_record())
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        mode: DeleteMode,
    ) -> Result<bool, StoreError> {
        self.round_trip().await?;

        let mut collection = self.collection.lock();
        let Some(position) = collection.documents.iter().position(|doc| {
            doc.in_scope(tenant, class) && doc.is_live() && doc.sequential_id() == Some(sequential_id)
        }) else {
            return Ok(false);
        };

        match mode {
            DeleteMode::Hard => {
                collection.documents.remove(position);
            }
            DeleteMode::Soft => {
                let now = Utc::now();
                let doc = &mut collection.documents[position];
                doc.deleted_at = Some(now);
                doc.updated_at = now;
                doc.name_key = None;
            }
        }
        Ok(true)
    }
}
