//! Database operations for the sync_records table.

use std::str::FromStr;

use async_trait::async_trait;
use crm_sync_engine::{EntityKind, ListScope, Page, PageRequest, Record};
use sqlx::Row;

use super::Pool;
use crate::error::RemoteError;
use crate::remote::{is_provisional, PageFetcher, RemoteWriter};

const COLUMNS: &str = "entity, id, sort_key, secondary_key, fields";

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub entity: String,
    pub id: String,
    pub sort_key: Option<i64>,
    pub secondary_key: Option<String>,
    pub fields: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            entity: row.try_get("entity")?,
            id: row.try_get("id")?,
            sort_key: row.try_get("sort_key")?,
            secondary_key: row.try_get("secondary_key")?,
            fields: row.try_get("fields")?,
        })
    }
}

impl StoredRecord {
    /// Convert a database row to an engine Record.
    pub fn to_record(&self) -> Result<Record, RemoteError> {
        let kind = EntityKind::from_str(&self.entity)
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(Record {
            id: self.id.clone(),
            kind,
            sort_key: self.sort_key,
            secondary_key: self.secondary_key.clone(),
            fields: self.fields.clone(),
        })
    }
}

/// Escape LIKE wildcards in a user-supplied search term.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Fetch one page of a scope, newest first.
///
/// Ids compare bytewise (`COLLATE "C"`) so ties order the same way the
/// engine orders them.
pub async fn fetch_records(
    pool: &Pool,
    scope: &ListScope,
    offset: u64,
    limit: u64,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    let search = scope.filter.search.as_deref().map(like_pattern);

    sqlx::query_as::<_, StoredRecord>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM sync_records
        WHERE entity = $1
          AND fields @> $2
          AND ($3::text IS NULL OR fields->>$4 ILIKE $3)
        ORDER BY sort_key DESC NULLS FIRST, id COLLATE "C" ASC
        OFFSET $5
        LIMIT $6
        "#
    ))
    .bind(scope.kind.as_str())
    .bind(scope.filter.containment())
    .bind(search)
    .bind(scope.kind.search_field())
    .bind(offset as i64)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

/// Get a record by kind and ID.
pub async fn get_record(
    pool: &Pool,
    kind: EntityKind,
    id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM sync_records WHERE entity = $1 AND id = $2"
    ))
    .bind(kind.as_str())
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Insert a record. Provisional ids and missing sort keys are assigned here.
pub async fn insert_record(pool: &Pool, record: &Record) -> Result<StoredRecord, sqlx::Error> {
    let id = (!is_provisional(&record.id)).then_some(record.id.as_str());

    sqlx::query_as::<_, StoredRecord>(&format!(
        r#"
        INSERT INTO sync_records (entity, id, sort_key, secondary_key, fields)
        VALUES (
            $1,
            COALESCE($2, gen_random_uuid()::text),
            COALESCE($3, (extract(epoch FROM clock_timestamp()) * 1000)::bigint),
            $4,
            $5
        )
        RETURNING {COLUMNS}
        "#
    ))
    .bind(record.kind.as_str())
    .bind(id)
    .bind(record.sort_key)
    .bind(&record.secondary_key)
    .bind(&record.fields)
    .fetch_one(pool)
    .await
}

/// Shallow-merge fields into a stored record.
pub async fn update_record_fields(
    pool: &Pool,
    kind: EntityKind,
    id: &str,
    fields: &serde_json::Value,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        r#"
        UPDATE sync_records
        SET fields = fields || $3, updated_at = now()
        WHERE entity = $1 AND id = $2
        RETURNING {COLUMNS}
        "#
    ))
    .bind(kind.as_str())
    .bind(id)
    .bind(fields)
    .fetch_optional(pool)
    .await
}

/// Delete a record. Returns whether a row was removed.
pub async fn delete_record(pool: &Pool, kind: EntityKind, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sync_records WHERE entity = $1 AND id = $2")
        .bind(kind.as_str())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Constraint violations are the server refusing the write.
fn write_error(err: sqlx::Error) -> RemoteError {
    match &err {
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation() =>
        {
            RemoteError::Rejected(db.message().to_string())
        }
        _ => RemoteError::Database(err),
    }
}

/// Remote store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgRemoteStore {
    pub(crate) pool: Pool,
}

impl PgRemoteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl PageFetcher for PgRemoteStore {
    async fn fetch_page(
        &self,
        scope: &ListScope,
        request: PageRequest,
    ) -> Result<Page, RemoteError> {
        let rows = fetch_records(&self.pool, scope, request.offset, request.probe_limit()).await?;
        let records = rows
            .iter()
            .map(StoredRecord::to_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::from_probe(records, &request))
    }
}

#[async_trait]
impl RemoteWriter for PgRemoteStore {
    async fn update_fields(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<Record, RemoteError> {
        if !fields.is_object() {
            return Err(RemoteError::Rejected("fields must be an object".into()));
        }
        update_record_fields(&self.pool, kind, id, fields)
            .await
            .map_err(write_error)?
            .ok_or_else(|| RemoteError::Rejected(format!("{kind} {id} not found")))?
            .to_record()
    }

    async fn insert(&self, record: &Record) -> Result<Record, RemoteError> {
        insert_record(&self.pool, record)
            .await
            .map_err(write_error)?
            .to_record()
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        if delete_record(&self.pool, kind, id).await? {
            Ok(())
        } else {
            Err(RemoteError::Rejected(format!("{kind} {id} not found")))
        }
    }
}
