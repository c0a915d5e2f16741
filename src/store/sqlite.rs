//! SQLite-backed store
//!
//! Synchronized tables are ordinary SQLite tables with an
//! `id INTEGER PRIMARY KEY` column plus the configured global-identifier,
//! sync-date and updated columns. Field typing comes from SQLite itself:
//! foreign keys from `PRAGMA foreign_key_list`, attachments from columns
//! declared with type `FILE`.
//!
//! Timestamps are stored as RFC 3339 text (see [`format_timestamp`]) so
//! that `updated > sync_date` compares correctly as text.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Pool, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use super::models::*;
use super::{Store, SyncLog, quote_identifier};
use crate::config::SyncSettings;
use crate::error::SyncError;

const ID_COLUMN: &str = "id";

/// Ids bound per statement, well below SQLite's host parameter limit
const MAX_BOUND_IDS: usize = 500;

/// Format a timestamp the way every sync column stores it
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SQLite connection pool plus cached table layouts
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    uid_field: String,
    sync_date_field: String,
    updated_field: String,
    schemas: RwLock<HashMap<String, TableSchema>>,
}

impl SqliteStore {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist and runs pending
    /// migrations. Foreign keys are not enforced: references are resolved
    /// at export time, and a dangling one is exported as unresolved.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path, settings: &SyncSettings) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SyncError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                SyncError::from(e)
            })?;

        tracing::info!(path = %path.display(), "Local store connected and migrated");

        Ok(Self {
            pool,
            uid_field: settings.uid_field.clone(),
            sync_date_field: settings.sync_date_field.clone(),
            updated_field: settings.updated_field.clone(),
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// Underlying pool, for the form layer that owns table DDL and CRUD
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Insert a record
    ///
    /// # Returns
    /// Local identity of the new record
    pub async fn insert(
        &self,
        table: &str,
        fields: &Map<String, Value>,
    ) -> Result<RecordId, SyncError> {
        let table_q = quote_identifier(table)?;

        if fields.is_empty() {
            let result = sqlx::query(&format!("INSERT INTO {} DEFAULT VALUES", table_q))
                .execute(&self.pool)
                .await?;
            return Ok(result.last_insert_rowid());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!("INSERT INTO {} (", table_q));
        for (index, name) in fields.keys().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.push(quote_identifier(name)?);
        }
        builder.push(") VALUES (");
        for (index, value) in fields.values().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            bind_json(&mut builder, value);
        }
        builder.push(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    /// Get one record by local identity
    pub async fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>, SyncError> {
        let mut records = self.query(table, &Filter::Ids(vec![id])).await?;
        Ok(records.pop())
    }

    /// Drop cached table layouts after DDL changes
    pub async fn forget_schemas(&self) {
        self.schemas.write().await.clear();
    }

    async fn load_schema(&self, table: &str) -> Result<TableSchema, SyncError> {
        let table_q = quote_identifier(table)?;

        let columns = sqlx::query(&format!("PRAGMA table_info({})", table_q))
            .fetch_all(&self.pool)
            .await?;
        if columns.is_empty() {
            return Err(SyncError::UnknownTable(table.to_string()));
        }

        let mut foreign_keys = HashMap::new();
        let rows = sqlx::query(&format!("PRAGMA foreign_key_list({})", table_q))
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let from: String = row.try_get("from")?;
            let target_table: String = row.try_get("table")?;
            let target_field: Option<String> = row.try_get("to")?;
            foreign_keys.insert(
                from,
                ForeignKey {
                    target_table,
                    target_field: target_field.unwrap_or_else(|| ID_COLUMN.to_string()),
                },
            );
        }

        let mut fields = Vec::with_capacity(columns.len());
        for row in columns {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            let kind = match foreign_keys.remove(&name) {
                Some(fk) => FieldKind::ForeignKey(fk),
                None if declared.eq_ignore_ascii_case("FILE") => FieldKind::File,
                None => FieldKind::Value,
            };
            fields.push(FieldDef { name, kind });
        }

        Ok(TableSchema {
            table: table.to_string(),
            fields,
        })
    }

    fn push_filter(
        &self,
        builder: &mut QueryBuilder<'_, Sqlite>,
        schema: &TableSchema,
        filter: &Filter,
    ) -> Result<(), SyncError> {
        match filter {
            Filter::All => {}
            Filter::ModifiedSinceSync => {
                if !schema.has_field(&self.sync_date_field) {
                    return Err(SyncError::Validation(format!(
                        "table {} has no {} column",
                        schema.table, self.sync_date_field
                    )));
                }
                let sync_date = quote_identifier(&self.sync_date_field)?;
                builder.push(format!(" WHERE {} IS NULL", sync_date));
                if schema.has_field(&self.updated_field) {
                    let updated = quote_identifier(&self.updated_field)?;
                    builder.push(format!(" OR {} > {}", updated, sync_date));
                }
            }
            Filter::Ids(ids) => {
                builder.push(format!(" WHERE {} IN (", quote_identifier(ID_COLUMN)?));
                for (index, id) in ids.iter().enumerate() {
                    if index > 0 {
                        builder.push(", ");
                    }
                    builder.push_bind(*id);
                }
                builder.push(")");
            }
            Filter::Uids(uids) => {
                if !schema.has_field(&self.uid_field) {
                    return Err(SyncError::Validation(format!(
                        "table {} has no {} column",
                        schema.table, self.uid_field
                    )));
                }
                builder.push(format!(" WHERE {} IN (", quote_identifier(&self.uid_field)?));
                for (index, uid) in uids.iter().enumerate() {
                    if index > 0 {
                        builder.push(", ");
                    }
                    builder.push_bind(uid.clone());
                }
                builder.push(")");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, SyncError> {
        if filter.is_empty_selection() {
            return Ok(Vec::new());
        }

        let schema = self.table_schema(table).await?;
        let table_q = quote_identifier(table)?;
        let mut records = Vec::new();
        for chunk in filter.chunks(MAX_BOUND_IDS) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {}", table_q));
            self.push_filter(&mut builder, &schema, &chunk)?;
            builder.push(format!(" ORDER BY {}", quote_identifier(ID_COLUMN)?));

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                records.push(row_to_record(row)?);
            }
        }

        records.sort_by_key(|record| record.id);
        records.dedup_by_key(|record| record.id);
        Ok(records)
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        fields: &Map<String, Value>,
    ) -> Result<u64, SyncError> {
        if fields.is_empty() || filter.is_empty_selection() {
            return Ok(0);
        }

        let schema = self.table_schema(table).await?;
        let table_q = quote_identifier(table)?;

        // Chunks of one selection commit together
        let mut tx = self.pool.begin().await?;
        let mut rows_affected = 0;
        for chunk in filter.chunks(MAX_BOUND_IDS) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", table_q));
            for (index, (name, value)) in fields.iter().enumerate() {
                if index > 0 {
                    builder.push(", ");
                }
                builder.push(format!("{} = ", quote_identifier(name)?));
                bind_json(&mut builder, value);
            }
            self.push_filter(&mut builder, &schema, &chunk)?;

            rows_affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        tracing::debug!(
            table = %table,
            rows = rows_affected,
            "Store update applied"
        );
        Ok(rows_affected)
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, SyncError> {
        {
            let schemas = self.schemas.read().await;
            if let Some(schema) = schemas.get(table) {
                return Ok(schema.clone());
            }
        }

        let schema = self.load_schema(table).await?;
        self.schemas
            .write()
            .await
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    async fn last_sync(&self, resource: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let last_sync = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_sync FROM sync_state WHERE resource = ?",
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;
        Ok(last_sync)
    }

    async fn set_last_sync(&self, resource: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (resource, last_sync)
            VALUES (?, ?)
            ON CONFLICT(resource) DO UPDATE SET last_sync = excluded.last_sync
            "#,
        )
        .bind(resource)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_import(
        &self,
        resource: &str,
        table: &str,
        records: Vec<Map<String, Value>>,
    ) -> Result<String, SyncError> {
        let id = ulid::Ulid::new().to_string();
        let record_count = records.len() as i64;
        let payload = serde_json::to_string(&records)?;

        sqlx::query(
            r#"
            INSERT INTO import_job (id, resource, table_name, payload, record_count, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(resource)
        .bind(table)
        .bind(payload)
        .bind(record_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            import_id = %id,
            resource = %resource,
            records = record_count,
            "Import job queued"
        );
        Ok(id)
    }

    async fn save_schema(&self, resource: &str, definition: &Value) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO form_schema (resource, definition, fetched_at)
            VALUES (?, ?, ?)
            ON CONFLICT(resource) DO UPDATE SET
                definition = excluded.definition,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(resource)
        .bind(serde_json::to_string(definition)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncLog for SqliteStore {
    async fn record(&self, entry: &SyncLogEntry) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (run_id, job_id, resource, table_name, job_type, mode, result, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.run_id)
        .bind(&entry.job_id)
        .bind(&entry.resource)
        .bind(&entry.table)
        .bind(entry.job_type.as_str())
        .bind(entry.mode.as_str())
        .bind(entry.result.as_str())
        .bind(&entry.message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn bind_json(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push_bind(None::<String>);
        }
        Value::Bool(flag) => {
            builder.push_bind(*flag);
        }
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                builder.push_bind(int);
            } else {
                builder.push_bind(number.as_f64().unwrap_or_default());
            }
        }
        Value::String(text) => {
            builder.push_bind(text.clone());
        }
        Value::Array(_) | Value::Object(_) => {
            builder.push_bind(value.to_string());
        }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<Record, SyncError> {
    let mut id = None;
    let mut fields = Map::new();

    for column in row.columns() {
        let value = column_value(row, column.ordinal())?;
        if column.name() == ID_COLUMN {
            id = value.as_i64();
        } else {
            fields.insert(column.name().to_string(), value);
        }
    }

    let id = id.ok_or_else(|| {
        SyncError::Validation(format!("row has no integer {} column", ID_COLUMN))
    })?;
    Ok(Record::new(id, fields))
}

fn column_value(row: &SqliteRow, index: usize) -> Result<Value, SyncError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    let value = match type_name.as_str() {
        "INTEGER" | "INT" | "INT8" | "BIGINT" => {
            Value::from(row.try_get_unchecked::<i64, _>(index)?)
        }
        "BOOLEAN" => Value::from(row.try_get_unchecked::<bool, _>(index)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
            Value::from(row.try_get_unchecked::<f64, _>(index)?)
        }
        "BLOB" => Value::from(STANDARD.encode(row.try_get_unchecked::<Vec<u8>, _>(index)?)),
        _ => Value::from(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}
