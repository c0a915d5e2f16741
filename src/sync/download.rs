//! Download tasks
//!
//! - [`DataDownload`]: records of a resource changed since its last sync,
//!   with their attachments fetched, queued for the import layer
//! - [`FileDownload`]: one attachment, persisted through the file store
//! - [`SchemaDownload`]: a resource's form definition

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;

use super::task::{Task, TaskKind, TaskOutput, TaskProgress};
use crate::SyncContext;
use crate::encoder::DecodedTable;
use crate::error::SyncError;
use crate::files::attachment_name;
use crate::metrics;
use crate::transport::ServerRef;

/// Query variable carrying the last-sync time
pub const MODIFIED_SINCE: &str = "msince";

/// `msince` format: UTC, truncated to whole seconds
const MODIFIED_SINCE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Attachment downloads in flight per data download
const ATTACHMENT_CONCURRENCY: usize = 4;

/// Scheme of attachments already stored on the device
const LOCAL_SCHEME: &str = "file:";

/// One import job created from a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRef {
    pub table: String,
    pub import_id: String,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub resource: String,
    /// Last-sync marker the request was based on, `None` on first sync
    pub since: Option<DateTime<Utc>>,
    pub imports: Vec<ImportRef>,
    pub records: usize,
    /// Attachments fetched and stored locally
    pub attachments: usize,
}

pub struct DataDownload {
    context: SyncContext,
    resource: String,
    table: String,
    server_ref: ServerRef,
}

impl DataDownload {
    pub fn new(
        context: SyncContext,
        resource: impl Into<String>,
        table: impl Into<String>,
        server_ref: ServerRef,
    ) -> Self {
        Self {
            context,
            resource: resource.into(),
            table: table.into(),
            server_ref,
        }
    }

    pub(crate) async fn execute(&self, task: &Task) -> Result<TaskOutput, SyncError> {
        let store = self.context.store.as_ref();

        let since = store.last_sync(&self.resource).await?;
        let server_ref = match since {
            Some(since) => self
                .server_ref
                .clone()
                .with_query(MODIFIED_SINCE, since.format(MODIFIED_SINCE_FORMAT).to_string()),
            None => self.server_ref.clone(),
        };

        // Changes made on the server while this request is in flight are
        // picked up by the next download
        let started = Utc::now();
        task.notify(TaskProgress::Fetching {
            endpoint: server_ref.endpoint.clone(),
        });
        let payload = self.context.transport.fetch(&server_ref).await?;
        let tables = self.context.encoder.decode(&payload, &self.table)?;

        let mut tables: Vec<DecodedTable> = tables
            .into_iter()
            .filter(|decoded| !decoded.records.is_empty())
            .collect();

        // Every attachment is stored before anything is queued
        let mut attachments = 0;
        for decoded in &mut tables {
            attachments += self.fetch_attachments(decoded).await?;
        }

        let mut imports = Vec::with_capacity(tables.len());
        let mut records = 0;
        for decoded in tables {
            let count = decoded.records.len();
            let import_id = store
                .enqueue_import(&self.resource, &decoded.table, decoded.records)
                .await?;
            imports.push(ImportRef {
                table: decoded.table,
                import_id,
                records: count,
            });
            records += count;
        }
        task.notify(TaskProgress::Importing { records });

        store.set_last_sync(&self.resource, started).await?;
        metrics::RECORDS_DOWNLOADED_TOTAL
            .with_label_values(&[self.resource.as_str()])
            .inc_by(records as u64);

        tracing::info!(
            resource = %self.resource,
            since = ?since,
            records,
            attachments,
            imports = imports.len(),
            "Download queued for import"
        );

        Ok(TaskOutput::Downloaded(DownloadReport {
            resource: self.resource.clone(),
            since,
            imports,
            records,
            attachments,
        }))
    }

    /// Download every remote attachment referenced by a file field and
    /// point the field at the local copy
    ///
    /// Tables unknown to the local store keep their URLs; the import layer
    /// decides what to do with them.
    async fn fetch_attachments(&self, decoded: &mut DecodedTable) -> Result<usize, SyncError> {
        let schema = match self.context.store.table_schema(&decoded.table).await {
            Ok(schema) => schema,
            Err(SyncError::UnknownTable(table)) => {
                tracing::debug!(table = %table, "No local table, attachments left remote");
                return Ok(0);
            }
            Err(error) => return Err(error),
        };
        let file_fields: Vec<String> = schema.file_fields().map(str::to_string).collect();
        if file_fields.is_empty() {
            return Ok(0);
        }

        let uid_field = &self.context.config.sync.uid_field;
        let mut pending = Vec::new();
        for (index, record) in decoded.records.iter().enumerate() {
            for field in &file_fields {
                let Some(url) = record.get(field).and_then(Value::as_str) else {
                    continue;
                };
                if url.is_empty() || url.starts_with(LOCAL_SCHEME) {
                    continue;
                }
                let Some(name) = attachment_name(url) else {
                    tracing::warn!(
                        table = %decoded.table,
                        field = %field,
                        url = %url,
                        "Attachment URL has no file name"
                    );
                    continue;
                };
                // Same record, same file: re-downloads overwrite
                let name = match record.get(uid_field).and_then(Value::as_str) {
                    Some(uid) => format!("{}-{}", uid, name),
                    None => name,
                };
                let download = FileDownload::new(self.context.clone(), url).with_name(name);
                pending.push((index, field.clone(), Task::new(TaskKind::FileDownload(download))));
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let results: Vec<_> = stream::iter(pending.iter().map(|(_, _, task)| task.clone()).collect::<Vec<_>>())
            .map(|task| task.done())
            .buffered(ATTACHMENT_CONCURRENCY)
            .collect()
            .await;

        let fetched = pending.len();
        for ((index, field, _), result) in pending.into_iter().zip(results) {
            let TaskOutput::File(uri) = result? else {
                return Err(SyncError::Internal(anyhow::anyhow!(
                    "file download resolved without a local URI"
                )));
            };
            decoded.records[index].insert(field, Value::String(uri));
        }

        tracing::debug!(table = %decoded.table, attachments = fetched, "Attachments downloaded");
        Ok(fetched)
    }
}

pub struct FileDownload {
    context: SyncContext,
    url: String,
    name: Option<String>,
}

impl FileDownload {
    pub fn new(context: SyncContext, url: impl Into<String>) -> Self {
        Self {
            context,
            url: url.into(),
            name: None,
        }
    }

    /// Store the file under `name` instead of the URL's last segment
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) async fn execute(&self, task: &Task) -> Result<TaskOutput, SyncError> {
        let name = self
            .name
            .clone()
            .or_else(|| attachment_name(&self.url))
            .ok_or_else(|| {
                SyncError::Validation(format!("cannot derive a file name from {}", self.url))
            })?;

        task.notify(TaskProgress::Fetching {
            endpoint: self.url.clone(),
        });
        let bytes = self.context.transport.fetch_file(&self.url).await?;
        let size = bytes.len();
        let uri = self.context.files.persist(&name, bytes).await?;

        tracing::debug!(url = %self.url, uri = %uri, bytes = size, "Attachment downloaded");
        Ok(TaskOutput::File(uri))
    }
}

pub struct SchemaDownload {
    context: SyncContext,
    resource: String,
    server_ref: ServerRef,
}

impl SchemaDownload {
    pub fn new(context: SyncContext, resource: impl Into<String>, server_ref: ServerRef) -> Self {
        Self {
            context,
            resource: resource.into(),
            server_ref,
        }
    }

    pub(crate) async fn execute(&self, task: &Task) -> Result<TaskOutput, SyncError> {
        task.notify(TaskProgress::Fetching {
            endpoint: self.server_ref.endpoint.clone(),
        });
        let definition = self.context.transport.fetch(&self.server_ref).await?;
        if definition.is_null() {
            return Err(SyncError::Validation(format!(
                "server returned no form definition for {}",
                self.resource
            )));
        }

        self.context
            .store
            .save_schema(&self.resource, &definition)
            .await?;
        tracing::info!(resource = %self.resource, "Form definition saved");
        Ok(TaskOutput::Schema(definition))
    }
}
