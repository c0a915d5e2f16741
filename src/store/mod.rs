//! Local store layer
//!
//! The engine consumes the local relational store through the narrow
//! [`Store`] and [`SyncLog`] traits. [`SqliteStore`] is the SQLite-backed
//! implementation used by the binary and the tests.
//!
//! Store contract: an update addressed by global identifier is atomic per
//! call. The engine does no locking of its own.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::{SqliteStore, format_timestamp};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Record access consumed by the sync engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch records of `table` matching `filter`
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, SyncError>;

    /// Set `fields` on every record of `table` matching `filter`
    ///
    /// # Returns
    /// Number of records updated
    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        fields: &Map<String, Value>,
    ) -> Result<u64, SyncError>;

    /// Typed field list of `table`
    async fn table_schema(&self, table: &str) -> Result<TableSchema, SyncError>;

    /// Target of a foreign-key field, `None` if `field` is not a foreign key
    async fn resolve_foreign_key(
        &self,
        table: &str,
        field: &str,
    ) -> Result<Option<ForeignKey>, SyncError> {
        let schema = self.table_schema(table).await?;
        Ok(schema.foreign_key(field).cloned())
    }

    /// Last successful download of `resource`
    async fn last_sync(&self, resource: &str) -> Result<Option<DateTime<Utc>>, SyncError>;

    /// Advance the last-sync marker of `resource`
    async fn set_last_sync(&self, resource: &str, at: DateTime<Utc>) -> Result<(), SyncError>;

    /// Queue downloaded records for the import layer
    ///
    /// # Returns
    /// Identifier of the created import job
    async fn enqueue_import(
        &self,
        resource: &str,
        table: &str,
        records: Vec<Map<String, Value>>,
    ) -> Result<String, SyncError>;

    /// Persist a downloaded form definition
    async fn save_schema(&self, resource: &str, definition: &Value) -> Result<(), SyncError>;
}

/// External sink for sync-log entries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncLog: Send + Sync {
    async fn record(&self, entry: &SyncLogEntry) -> Result<(), SyncError>;
}

/// Sync-log sink that only emits tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSyncLog;

#[async_trait]
impl SyncLog for TracingSyncLog {
    async fn record(&self, entry: &SyncLogEntry) -> Result<(), SyncError> {
        tracing::info!(
            run_id = %entry.run_id,
            job_id = %entry.job_id,
            resource = %entry.resource,
            table = %entry.table,
            job_type = %entry.job_type,
            mode = %entry.mode,
            result = %entry.result,
            message = ?entry.message,
            "Sync log entry"
        );
        Ok(())
    }
}

/// Whether `name` can be used as a table or column name
///
/// Table and column names are interpolated into SQL, so only ASCII
/// letters, digits and underscores are accepted, and the first
/// character must not be a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote a validated identifier for interpolation into SQL
pub(crate) fn quote_identifier(name: &str) -> Result<String, SyncError> {
    if !is_valid_identifier(name) {
        return Err(SyncError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(is_valid_identifier("person"));
        assert!(is_valid_identifier("_household_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2person"));
        assert!(!is_valid_identifier("person\"; --"));
        assert!(!is_valid_identifier("house hold"));
    }

    #[test]
    fn quoting_rejects_invalid_names() {
        assert_eq!(quote_identifier("person").unwrap(), "\"person\"");
        assert!(matches!(
            quote_identifier("a-b"),
            Err(SyncError::InvalidIdentifier(name)) if name == "a-b"
        ));
    }
}
