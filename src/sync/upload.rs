//! DataUpload task
//!
//! Sends an export payload with its attachments and reconciles the server's
//! answer: a record's sync date advances only if its global identifier was
//! uploaded and the server did not reject it. A failed send marks nothing.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::export::ExportPayload;
use super::task::{Task, TaskOutput, TaskProgress};
use crate::SyncContext;
use crate::encoder::{ERROR_KEY, UID_KEY, table_from_key};
use crate::error::SyncError;
use crate::metrics;
use crate::store::{Filter, format_timestamp};
use crate::transport::{Attachment, ServerRef, UploadRequest};

/// One record the server refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub uid: String,
    pub message: Option<String>,
}

/// Reconciliation outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Global identifiers marked synchronized, per table
    pub accepted: BTreeMap<String, Vec<String>>,
    pub rejected: BTreeMap<String, Vec<Rejection>>,
    /// Local rows whose sync date was set
    pub updated: u64,
}

impl UploadReport {
    pub fn accepted_count(&self) -> usize {
        self.accepted.values().map(Vec::len).sum()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.values().map(Vec::len).sum()
    }
}

/// Rejected global identifiers per table found in an upload response
///
/// The error tree may sit anywhere in the response, for instance under a
/// status envelope. Every `"$_" + table` array is visited, including those
/// nested inside items, and an item is rejected only when it bears a
/// non-null `"@error"`.
pub fn parse_rejections(response: &Value) -> BTreeMap<String, Vec<Rejection>> {
    let mut rejected = BTreeMap::new();
    collect(response, &mut rejected);
    rejected
}

fn collect(node: &Value, out: &mut BTreeMap<String, Vec<Rejection>>) {
    match node {
        Value::Object(object) => {
            for (key, value) in object {
                match (table_from_key(key), value) {
                    (Some(table), Value::Array(items)) => {
                        for item in items {
                            collect_item(table, item, out);
                            collect(item, out);
                        }
                    }
                    _ => collect(value, out),
                }
            }
        }
        Value::Array(values) => values.iter().for_each(|value| collect(value, out)),
        _ => {}
    }
}

fn collect_item(table: &str, item: &Value, out: &mut BTreeMap<String, Vec<Rejection>>) {
    let Value::Object(object) = item else {
        return;
    };
    let Some(error) = object
        .get(ERROR_KEY)
        .filter(|error| !matches!(error, Value::Null | Value::Bool(false)))
    else {
        return;
    };
    let Some(uid) = object.get(UID_KEY).and_then(Value::as_str) else {
        tracing::warn!(table = %table, error = %error, "Rejected item has no global identifier");
        return;
    };

    out.entry(table.to_string()).or_default().push(Rejection {
        uid: uid.to_string(),
        message: Some(match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        }),
    });
}

#[derive(Clone)]
pub struct DataUpload {
    context: SyncContext,
    resource: String,
    server_ref: ServerRef,
    payload: ExportPayload,
}

impl DataUpload {
    pub fn new(
        context: SyncContext,
        resource: impl Into<String>,
        server_ref: ServerRef,
        payload: ExportPayload,
    ) -> Self {
        Self {
            context,
            resource: resource.into(),
            server_ref,
            payload,
        }
    }

    pub fn payload(&self) -> &ExportPayload {
        &self.payload
    }

    pub(crate) async fn execute(&self, task: &Task) -> Result<TaskOutput, SyncError> {
        if self.payload.is_empty() {
            tracing::debug!(resource = %self.resource, "Nothing to upload");
            return Ok(TaskOutput::Uploaded(UploadReport::default()));
        }

        let mut attachments = Vec::with_capacity(self.payload.attachments.len());
        for (name, uri) in &self.payload.attachments {
            let bytes = self.context.files.read(uri).await?;
            attachments.push(Attachment {
                name: name.clone(),
                bytes,
            });
        }

        task.notify(TaskProgress::Sending {
            records: self.payload.record_count(),
            attachments: attachments.len(),
        });

        let request = UploadRequest {
            document: self.payload.document.clone(),
            attachments,
        };
        let response = self.context.transport.send(&self.server_ref, &request).await?;

        let report = self.reconcile(&response).await?;
        tracing::info!(
            resource = %self.resource,
            accepted = report.accepted_count(),
            rejected = report.rejected_count(),
            updated = report.updated,
            "Upload reconciled"
        );
        Ok(TaskOutput::Uploaded(report))
    }

    async fn reconcile(&self, response: &Value) -> Result<UploadReport, SyncError> {
        let rejected = parse_rejections(response);
        let sync_date_field = &self.context.config.sync.sync_date_field;
        let now = format_timestamp(Utc::now());

        let mut report = UploadReport::default();
        for (table, uploaded) in &self.payload.uids {
            let refused: BTreeSet<&str> = rejected
                .get(table)
                .map(|rejections| rejections.iter().map(|r| r.uid.as_str()).collect())
                .unwrap_or_default();
            let accepted: Vec<String> = uploaded
                .iter()
                .filter(|uid| !refused.contains(uid.as_str()))
                .cloned()
                .collect();
            if accepted.is_empty() {
                continue;
            }

            let mut fields = Map::new();
            fields.insert(sync_date_field.clone(), Value::String(now.clone()));
            report.updated += self
                .context
                .store
                .update(table, &Filter::Uids(accepted.clone()), &fields)
                .await?;

            metrics::RECORDS_UPLOADED_TOTAL
                .with_label_values(&[table.as_str()])
                .inc_by(accepted.len() as u64);
            report.accepted.insert(table.clone(), accepted);
        }

        for (table, rejections) in rejected {
            for rejection in &rejections {
                tracing::warn!(
                    resource = %self.resource,
                    table = %table,
                    uid = %rejection.uid,
                    message = ?rejection.message,
                    "Server rejected record"
                );
            }
            metrics::RECORDS_REJECTED_TOTAL
                .with_label_values(&[table.as_str()])
                .inc_by(rejections.len() as u64);
            report.rejected.insert(table, rejections);
        }

        Ok(report)
    }
}
