//! Error types for allocation and storage operations

use sea_orm::{DbErr, RuntimeErr};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for allocator operations
pub type Result<T> = std::result::Result<T, AllocatorError>;

/// Storage-level uniqueness constraints a write can trip
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniqueConstraint {
    /// `(tenant_id, resource_class, sequential_id)`
    SequentialId,
    /// `(tenant_id, resource_class, name_key)`
    DisplayName,
}

impl fmt::Display for UniqueConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequentialId => f.write_str("(tenant_id, resource_class, sequential_id)"),
            Self::DisplayName => f.write_str("(tenant_id, resource_class, name_key)"),
        }
    }
}

/// Errors raised by a `SequenceStore`
#[derive(Error, Debug)]
pub enum StoreError {
    /// The write would duplicate a value under a declared uniqueness constraint
    #[error("Uniqueness violation on {constraint}")]
    UniquenessViolation { constraint: UniqueConstraint },

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// A storage call did not complete within the configured timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Backend cannot serve requests right now
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A row that should be well-formed was not
    #[error("Corrupt record {record_key}: {message}")]
    CorruptRecord { record_key: i64, message: String },
}

impl StoreError {
    /// Whether repeating the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Unavailable(_) => true,
            Self::Database(DbErr::Conn(_) | DbErr::ConnectionAcquire(_)) => true,
            Self::Database(DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e))) => e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| is_transient_code(&code)),
            _ => false,
        }
    }
}

/// Lock contention and serialization failures that clear up on their own
fn is_transient_code(code: &str) -> bool {
    matches!(
        code,
        // PostgreSQL serialization failure, deadlock
        "40001" | "40P01"
        // MySQL deadlock, lock wait timeout
        | "1213" | "1205"
        // SQLite busy, locked and their extended forms
        | "5" | "6" | "261" | "262" | "517"
    )
}

/// Errors surfaced by `SequentialAllocator`
#[derive(Error, Debug)]
pub enum AllocatorError {
    /// Tenant reference is structurally malformed
    #[error("Invalid tenant reference: {0:?}")]
    InvalidTenant(String),

    #[error("Invalid resource class: {0:?}")]
    InvalidResourceClass(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    /// Another live record in the tenant scope already uses this name (any casing)
    #[error("{resource_class} named {name:?} already exists for tenant {tenant}")]
    DuplicateName {
        tenant: String,
        resource_class: String,
        name: String,
    },

    /// Retry budget spent under sustained contention; safe to retry later
    #[error("Could not allocate a sequential id after {attempts} attempts ({elapsed:?})")]
    AllocationExhausted { attempts: u32, elapsed: Duration },

    #[error("Sequence {resource_class} for tenant {tenant} has no ids left")]
    SequenceOverflow {
        tenant: String,
        resource_class: String,
    },

    #[error("{resource_class} #{sequential_id} not found for tenant {tenant}")]
    NotFound {
        tenant: String,
        resource_class: String,
        sequential_id: u64,
    },

    #[error("Invalid allocator configuration: {0}")]
    InvalidConfig(String),

    /// Underlying storage failure, passed through unchanged
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl AllocatorError {
    /// Transient failures the caller may retry as-is
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AllocationExhausted { .. } => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Failures caused by the request itself, which must be corrected before resubmitting
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTenant(_)
                | Self::InvalidResourceClass(_)
                | Self::InvalidDisplayName(_)
                | Self::DuplicateName { .. }
                | Self::NotFound { .. }
        )
    }
}
