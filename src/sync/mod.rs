//! Synchronization engine
//!
//! - `task`: run-once tasks with a shared completion signal
//! - `reference`: local identity to global identifier resolution
//! - `export` / `upload`: push path
//! - `download`: pull path (records, attachments, form definitions)
//! - `job` / `run`: sequencing, status and sync log

mod download;
mod export;
mod job;
mod reference;
mod run;
mod task;
mod upload;

pub use download::{
    DataDownload, DownloadReport, FileDownload, ImportRef, MODIFIED_SINCE, SchemaDownload,
};
pub use export::{DataExport, ExportPayload};
pub use job::{JobStatus, JobType, SyncJob, SyncMode};
pub use reference::{
    LoadScope, ReferenceItem, ReferenceMap, ReferenceRegistry, SharedReferenceMap, UidLookup,
};
pub use run::{JobSummary, RunSummary, SyncRun};
pub use task::{Completion, Task, TaskKind, TaskOutput, TaskProgress, TaskResult, TaskState};
pub use upload::{DataUpload, Rejection, UploadReport, parse_rejections};

#[cfg(test)]
pub(crate) mod testing {
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::SyncContext;
    use crate::config::tests::valid_config;
    use crate::encoder::JsonEncoder;
    use crate::files::MockFileStore;
    use crate::store::{MockStore, SqliteStore, TracingSyncLog};
    use crate::transport::MockTransport;

    pub(crate) fn fields(value: Value) -> Map<String, Value> {
        value
            .as_object()
            .cloned()
            .expect("test fields must be a JSON object")
    }

    /// Store with `household` and `person` tables on a temporary database
    pub(crate) async fn sqlite_store() -> (Arc<SqliteStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let settings = valid_config().sync;
        let store = SqliteStore::connect(&temp_dir.path().join("test.db"), &settings)
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE household (
                id INTEGER PRIMARY KEY,
                uuid TEXT,
                village TEXT,
                photo FILE,
                updated TEXT,
                sync_date TEXT
            )",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE person (
                id INTEGER PRIMARY KEY,
                uuid TEXT,
                name TEXT,
                household INTEGER REFERENCES household(id),
                updated TEXT,
                sync_date TEXT
            )",
        )
        .execute(store.pool())
        .await
        .unwrap();

        (Arc::new(store), temp_dir)
    }

    /// Context over a real store and mocked remote collaborators
    pub(crate) fn context(
        store: Arc<SqliteStore>,
        transport: MockTransport,
        files: MockFileStore,
    ) -> SyncContext {
        let config = valid_config();
        SyncContext {
            encoder: Arc::new(JsonEncoder::new(config.sync.uid_field.clone())),
            config: Arc::new(config),
            store: store.clone(),
            sync_log: store,
            transport: Arc::new(transport),
            files: Arc::new(files),
        }
    }

    /// Context whose store panics on any call
    pub(crate) fn mock_context(transport: MockTransport, files: MockFileStore) -> SyncContext {
        let config = valid_config();
        SyncContext {
            encoder: Arc::new(JsonEncoder::new(config.sync.uid_field.clone())),
            config: Arc::new(config),
            store: Arc::new(MockStore::new()),
            sync_log: Arc::new(TracingSyncLog),
            transport: Arc::new(transport),
            files: Arc::new(files),
        }
    }
}
