//! Sea-ORM backed `SequenceStore` for SQLite, PostgreSQL and MySQL (TiDB)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Index, IndexCreateStatement};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, Database, DatabaseConnection,
    DbBackend, DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder, Schema, Set, SqlErr,
    TransactionTrait,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::entity::{allocated_records, sequence_counters, AllocatedRecords, SequenceCounters};
use crate::error::{StoreError, UniqueConstraint};
use crate::store::{DeleteMode, SequenceStore};
use crate::types::{
    AllocatedRecord, DisplayName, ResourceClass, SequentialId, TenantId, MAX_SAFE_SEQUENTIAL_ID,
};

const SEQUENTIAL_ID_INDEX: &str = "uq_allocated_records_sequential_id";
const NAME_KEY_INDEX: &str = "uq_allocated_records_name_key";

/// Relational store; uniqueness is enforced by unique indexes
pub struct SqlStore {
    connection: DatabaseConnection,
}

impl SqlStore {
    /// Connect with the configured pool settings, retrying transient failures
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        info!("Connecting to sequence database {}", mask_url(&config.url));

        let mut attempts = 0;
        loop {
            attempts += 1;

            match Database::connect(config.connect_options()).await {
                Ok(connection) => {
                    info!(
                        "Connected to sequence database (max connections: {}, min: {})",
                        config.max_connections, config.min_connections
                    );
                    return Ok(Self { connection });
                }
                Err(e) if attempts < config.connect_attempts => {
                    warn!(
                        "Failed to connect to sequence database (attempt {}/{}): {}",
                        attempts, config.connect_attempts, e
                    );
                    tokio::time::sleep(config.connect_retry_delay).await;
                }
                Err(e) => {
                    error!("Failed to connect to sequence database after {} attempts", attempts);
                    return Err(StoreError::Database(e));
                }
            }
        }
    }

    pub fn from_connection(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Create tables and unique indexes if they do not exist yet
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let backend = self.connection.get_database_backend();
        let schema = Schema::new(backend);

        let tables = [
            schema
                .create_table_from_entity(AllocatedRecords)
                .if_not_exists()
                .to_owned(),
            schema
                .create_table_from_entity(SequenceCounters)
                .if_not_exists()
                .to_owned(),
        ];
        for stmt in &tables {
            self.connection.execute(backend.build(stmt)).await?;
        }

        let indexes = [
            unique_index(SEQUENTIAL_ID_INDEX, allocated_records::Column::SequentialId),
            unique_index(NAME_KEY_INDEX, allocated_records::Column::NameKey),
        ];
        for mut stmt in indexes {
            // MySQL has no CREATE INDEX IF NOT EXISTS
            if backend != DbBackend::MySql {
                stmt.if_not_exists();
            }
            match self.connection.execute(backend.build(&stmt)).await {
                Ok(_) => {}
                Err(e) if backend == DbBackend::MySql && e.to_string().contains("Duplicate key name") => {
                    debug!("Index already present: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Sequence schema initialized");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.connection.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for SqlStore {
    async fn query_max_sequential_id(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
    ) -> Result<u64, StoreError> {
        // Soft-deleted rows stay in scope; only corrupt ids are filtered out
        let stored = AllocatedRecords::find()
            .filter(scope(tenant, class))
            .filter(allocated_records::Column::SequentialId.between(1i64, MAX_SAFE_SEQUENTIAL_ID as i64))
            .order_by_desc(allocated_records::Column::SequentialId)
            .one(&self.connection)
            .await?
            .and_then(|row| row.sequential_id)
            .unwrap_or(0);

        let counter = SequenceCounters::find_by_id(counter_key(tenant, class))
            .one(&self.connection)
            .await?
            .map(|row| row.last_allocated)
            .unwrap_or(0);

        Ok(stored.max(counter).max(0) as u64)
    }

    async fn exists_by_name_case_insensitive(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        name: &DisplayName,
        exclude: Option<SequentialId>,
    ) -> Result<bool, StoreError> {
        let mut query = AllocatedRecords::find()
            .filter(scope(tenant, class))
            .filter(allocated_records::Column::DeletedAt.is_null())
            .filter(allocated_records::Column::NameKey.eq(name.key()));

        if let Some(excluded) = exclude {
            query = query.filter(
                Condition::any()
                    .add(allocated_records::Column::SequentialId.ne(excluded.get() as i64))
                    .add(allocated_records::Column::SequentialId.is_null()),
            );
        }

        Ok(query.one(&self.connection).await?.is_some())
    }

    async fn insert_if_unique(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        name: &DisplayName,
        payload: &Value,
    ) -> Result<AllocatedRecord, StoreError> {
        let now = Utc::now();
        let txn = self.connection.begin().await?;

        let inserted = async {
            let row = allocated_records::ActiveModel {
                id: NotSet,
                tenant_id: Set(tenant.as_str().to_string()),
                resource_class: Set(class.as_str().to_string()),
                sequential_id: Set(Some(sequential_id.get() as i64)),
                display_name: Set(name.as_str().to_string()),
                name_key: Set(Some(name.key().to_string())),
                payload: Set(payload_column(payload)),
                created_at: Set(now),
                updated_at: Set(now),
                deleted_at: Set(None),
            }
            .insert(&txn)
            .await?;

            raise_counter(&txn, tenant, class, sequential_id.get() as i64, now).await?;
            Ok::<_, DbErr>(row)
        }
        .await;

        match inserted {
            Ok(row) => {
                txn.commit().await.map_err(classify)?;
                into_record(row, tenant, class)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!("Rollback after failed insert also failed: {}", rollback);
                }
                Err(classify(e))
            }
        }
    }

    async fn find_by_sequential_id(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
    ) -> Result<Option<AllocatedRecord>, StoreError> {
        AllocatedRecords::find()
            .filter(live_record(tenant, class, sequential_id))
            .one(&self.connection)
            .await?
            .map(|row| into_record(row, tenant, class))
            .transpose()
    }

    async fn list_live(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
    ) -> Result<Vec<AllocatedRecord>, StoreError> {
        AllocatedRecords::find()
            .filter(scope(tenant, class))
            .filter(allocated_records::Column::DeletedAt.is_null())
            .filter(allocated_records::Column::SequentialId.between(1i64, MAX_SAFE_SEQUENTIAL_ID as i64))
            .order_by_asc(allocated_records::Column::SequentialId)
            .all(&self.connection)
            .await?
            .into_iter()
            .map(|row| into_record(row, tenant, class))
            .collect()
    }

    async fn rename(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        name: &DisplayName,
    ) -> Result<Option<AllocatedRecord>, StoreError> {
        let Some(row) = AllocatedRecords::find()
            .filter(live_record(tenant, class, sequential_id))
            .one(&self.connection)
            .await?
        else {
            return Ok(None);
        };

        let mut active: allocated_records::ActiveModel = row.into();
        active.display_name = Set(name.as_str().to_string());
        active.name_key = Set(Some(name.key().to_string()));
        active.updated_at = Set(Utc::now());

        let updated = active.update(&self.connection).await.map_err(classify)?;
        into_record(updated, tenant, class).map(Some)
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        class: &ResourceClass,
        sequential_id: SequentialId,
        mode: DeleteMode,
    ) -> Result<bool, StoreError> {
        let filter = live_record(tenant, class, sequential_id);

        let rows_affected = match mode {
            DeleteMode::Hard => {
                AllocatedRecords::delete_many()
                    .filter(filter)
                    .exec(&self.connection)
                    .await?
                    .rows_affected
            }
            DeleteMode::Soft => {
                let now = Utc::now();
                AllocatedRecords::update_many()
                    .col_expr(allocated_records::Column::DeletedAt, Expr::value(now))
                    .col_expr(allocated_records::Column::UpdatedAt, Expr::value(now))
                    .col_expr(allocated_records::Column::NameKey, Expr::value(Option::<String>::None))
                    .filter(filter)
                    .exec(&self.connection)
                    .await?
                    .rows_affected
            }
        };

        Ok(rows_affected > 0)
    }
}

/// Raise the high-water mark to `sequential_id` if it is lower. Never lowers it.
async fn raise_counter<C: ConnectionTrait>(
    conn: &C,
    tenant: &TenantId,
    class: &ResourceClass,
    sequential_id: i64,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    let raised = SequenceCounters::update_many()
        .col_expr(sequence_counters::Column::LastAllocated, Expr::value(sequential_id))
        .col_expr(sequence_counters::Column::UpdatedAt, Expr::value(now))
        .filter(sequence_counters::Column::TenantId.eq(tenant.as_str()))
        .filter(sequence_counters::Column::ResourceClass.eq(class.as_str()))
        .filter(sequence_counters::Column::LastAllocated.lt(sequential_id))
        .exec(conn)
        .await?;
    if raised.rows_affected > 0 {
        return Ok(());
    }

    let existing = SequenceCounters::find_by_id(counter_key(tenant, class))
        .one(conn)
        .await?;
    if existing.is_none() {
        // A concurrent first insert makes this fail on the primary key, which the
        // caller sees as a sequence conflict and retries
        SequenceCounters::insert(sequence_counters::ActiveModel {
            tenant_id: Set(tenant.as_str().to_string()),
            resource_class: Set(class.as_str().to_string()),
            last_allocated: Set(sequential_id),
            updated_at: Set(now),
        })
        .exec_without_returning(conn)
        .await?;
    }
    Ok(())
}

fn scope(tenant: &TenantId, class: &ResourceClass) -> Condition {
    Condition::all()
        .add(allocated_records::Column::TenantId.eq(tenant.as_str()))
        .add(allocated_records::Column::ResourceClass.eq(class.as_str()))
}

fn live_record(tenant: &TenantId, class: &ResourceClass, sequential_id: SequentialId) -> Condition {
    scope(tenant, class)
        .add(allocated_records::Column::DeletedAt.is_null())
        .add(allocated_records::Column::SequentialId.eq(sequential_id.get() as i64))
}

fn counter_key(tenant: &TenantId, class: &ResourceClass) -> (String, String) {
    (tenant.as_str().to_string(), class.as_str().to_string())
}

fn unique_index(name: &str, column: allocated_records::Column) -> IndexCreateStatement {
    Index::create()
        .name(name)
        .table(AllocatedRecords)
        .col(allocated_records::Column::TenantId)
        .col(allocated_records::Column::ResourceClass)
        .col(column)
        .unique()
        .to_owned()
}

fn payload_column(payload: &Value) -> Option<Value> {
    (!payload.is_null()).then(|| payload.clone())
}

fn into_record(
    row: allocated_records::Model,
    tenant: &TenantId,
    class: &ResourceClass,
) -> Result<AllocatedRecord, StoreError> {
    let sequential_id = row
        .sequential_id
        .and_then(|value| u64::try_from(value).ok())
        .and_then(SequentialId::new)
        .ok_or_else(|| StoreError::CorruptRecord {
            record_key: row.id,
            message: format!("invalid sequential id {:?}", row.sequential_id),
        })?;

    Ok(AllocatedRecord {
        record_key: row.id,
        tenant_id: tenant.clone(),
        resource_class: class.clone(),
        sequential_id,
        display_name: row.display_name,
        payload: row.payload.unwrap_or(Value::Null),
        created_at: row.created_at,
        updated_at: row.updated_at,
        deleted_at: row.deleted_at,
    })
}

/// Map unique-index failures onto the constraint they protect
fn classify(err: DbErr) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(message)) => {
            let constraint = violated_constraint(&message);
            debug!("Unique constraint violation on {}: {}", constraint, message);
            StoreError::UniquenessViolation { constraint }
        }
        _ => StoreError::Database(err),
    }
}

/// Pick the violated constraint out of a driver message.
///
/// MySQL echoes the duplicate entry (tenant, class and name) before the key name, so only
/// the identifier part after the last marker is inspected.
fn violated_constraint(message: &str) -> UniqueConstraint {
    const MARKERS: [&str; 3] = [
        "for key ",           // MySQL
        "unique constraint ", // PostgreSQL
        "constraint failed:", // SQLite
    ];
    let identifiers = MARKERS
        .iter()
        .filter_map(|marker| message.rfind(marker).map(|at| &message[at + marker.len()..]))
        .min_by_key(|rest| rest.len())
        .unwrap_or(message);

    if identifiers.contains(NAME_KEY_INDEX) || identifiers.contains("allocated_records.name_key") {
        UniqueConstraint::DisplayName
    } else {
        UniqueConstraint::SequentialId
    }
}

/// Hide the password part of a connection URL for logging
pub fn mask_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("****")).is_ok() {
                parsed.to_string()
            } else {
                "****".to_string()
            }
        }
        Ok(_) => raw.to_string(),
        Err(_) => match raw.rfind('@') {
            Some(at) => format!("****{}", &raw[at..]),
            None => raw.to_string(),
        },
    }
}
