//! DataExport task
//!
//! Collects every record of a table that is new or modified since its last
//! sync, then follows foreign keys until no referenced record is left
//! unresolved. Each round loads the pending records of every touched table
//! concurrently; the next round starts only after all loads of the current
//! one have settled.
//!
//! The result is a [`DataUpload`] task carrying one document with an entry
//! per reachable `(table, record)` pair, foreign keys replaced by global
//! identifiers.

use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use super::reference::{LoadScope, ReferenceRegistry, UidLookup};
use super::task::{Task, TaskKind, TaskOutput, TaskProgress};
use super::upload::DataUpload;
use crate::SyncContext;
use crate::encoder::{ResolvedRecord, merge_fragment};
use crate::error::SyncError;
use crate::files::attachment_name;
use crate::store::{FieldKind, ForeignKey, Record, RecordId, TableSchema};
use crate::transport::ServerRef;

/// Column foreign keys must target to be rewritten into global identifiers
const LOCAL_KEY: &str = "id";

/// Complete, self-consistent upload payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportPayload {
    /// Wire document, one `"$_" + table` array per table
    pub document: Value,
    /// Global identifiers uploaded per table
    pub uids: BTreeMap<String, Vec<String>>,
    /// Attachment name -> local URI
    pub attachments: BTreeMap<String, String>,
}

impl ExportPayload {
    pub fn is_empty(&self) -> bool {
        self.uids.values().all(Vec::is_empty)
    }

    pub fn record_count(&self) -> usize {
        self.uids.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
struct ExportState {
    /// Records that belong in the payload
    included: BTreeMap<String, BTreeSet<RecordId>>,
    /// Records whose references have already been followed
    scanned: BTreeSet<(String, RecordId)>,
    attachments: BTreeMap<String, String>,
}

pub struct DataExport {
    context: SyncContext,
    references: Arc<ReferenceRegistry>,
    resource: String,
    table: String,
    server_ref: ServerRef,
    state: Mutex<ExportState>,
}

impl DataExport {
    pub fn new(
        context: SyncContext,
        references: Arc<ReferenceRegistry>,
        resource: impl Into<String>,
        table: impl Into<String>,
        server_ref: ServerRef,
    ) -> Self {
        Self {
            context,
            references,
            resource: resource.into(),
            table: table.into(),
            server_ref,
            state: Mutex::new(ExportState::default()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Global identifier of a referenced record, pulling it into this export
    ///
    /// Returns [`UidLookup::Pending`] until the next load round has run.
    pub async fn get_uid(&self, table: &str, id: RecordId) -> UidLookup {
        self.include(table, [id]);
        let map = self.references.map(table);
        let mut map = map.lock().await;
        map.get_uid(id)
    }

    /// Attachment name for a local file URI, registering the attachment
    ///
    /// Two URIs with the same final segment share one name; the first URI
    /// registered wins.
    pub fn get_file(&self, uri: &str) -> Option<String> {
        let name = attachment_name(uri)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.attachments.get(&name) {
            Some(existing) if existing != uri => {
                tracing::warn!(
                    name = %name,
                    kept = %existing,
                    dropped = %uri,
                    "Attachment name collision"
                );
            }
            Some(_) => {}
            None => {
                state.attachments.insert(name.clone(), uri.to_string());
            }
        }
        Some(name)
    }

    fn include(&self, table: &str, ids: impl IntoIterator<Item = RecordId>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .included
            .entry(table.to_string())
            .or_default()
            .extend(ids);
    }

    fn included(&self) -> BTreeMap<String, BTreeSet<RecordId>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.included.clone()
    }

    pub(crate) async fn execute(&self, task: &Task) -> Result<TaskOutput, SyncError> {
        let store = self.context.store.as_ref();

        let roots = {
            let map = self.references.map(&self.table);
            let mut map = map.lock().await;
            map.load(store, LoadScope::Modified).await?
        };
        tracing::debug!(
            resource = %self.resource,
            table = %self.table,
            records = roots.len(),
            "Export roots loaded"
        );
        self.include(&self.table, roots);

        let mut schemas = HashMap::new();
        let mut round = 0;
        loop {
            while self.scan(&mut schemas).await? > 0 {}

            let pending = self.pending_tables().await;
            if pending.is_empty() {
                break;
            }

            round += 1;
            task.notify(TaskProgress::Loading {
                round,
                tables: pending.clone(),
            });

            let loads = pending.iter().map(|table| async move {
                let map = self.references.map(table);
                let mut map = map.lock().await;
                map.load(store, LoadScope::Pending).await
            });
            // Every load settles before the first failure is reported
            for result in join_all(loads).await {
                result?;
            }
        }

        let payload = self.flatten(task, &mut schemas).await?;
        tracing::info!(
            resource = %self.resource,
            table = %self.table,
            records = payload.record_count(),
            attachments = payload.attachments.len(),
            rounds = round,
            "Export complete"
        );

        let upload = DataUpload::new(
            self.context.clone(),
            self.resource.clone(),
            self.server_ref.clone(),
            payload,
        );
        Ok(TaskOutput::Upload(Task::new(TaskKind::DataUpload(upload))))
    }

    /// Follow references of included records that are loaded but not yet scanned
    ///
    /// # Returns
    /// Number of records scanned
    async fn scan(&self, schemas: &mut HashMap<String, TableSchema>) -> Result<usize, SyncError> {
        let mut scanned = 0;

        for (table, ids) in self.included() {
            let records = self.unscanned_records(&table, &ids).await;
            if records.is_empty() {
                continue;
            }
            let schema = self.schema(schemas, &table).await?;

            for (id, record) in records {
                if let Some(record) = record {
                    for (field, fk) in schema.foreign_keys() {
                        if let Some(target) = local_reference(fk, record.get(field)) {
                            self.get_uid(&fk.target_table, target).await;
                        }
                    }
                    for field in schema.file_fields() {
                        if let Some(uri) = record.get_str(field) {
                            self.get_file(uri);
                        }
                    }
                }

                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.scanned.insert((table.clone(), id));
                scanned += 1;
            }
        }

        Ok(scanned)
    }

    /// Settled but unscanned records among `ids`; `None` data marks an orphan
    async fn unscanned_records(
        &self,
        table: &str,
        ids: &BTreeSet<RecordId>,
    ) -> Vec<(RecordId, Option<Record>)> {
        let candidates: Vec<RecordId> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .copied()
                .filter(|id| !state.scanned.contains(&(table.to_string(), *id)))
                .collect()
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let map = self.references.map(table);
        let map = map.lock().await;
        candidates
            .into_iter()
            .filter_map(|id| {
                let item = map.item(id)?;
                if item.pending {
                    None
                } else {
                    Some((id, item.data.clone()))
                }
            })
            .collect()
    }

    /// Tables holding pending records this export depends on
    async fn pending_tables(&self) -> Vec<String> {
        let mut pending = Vec::new();
        for (table, ids) in self.included() {
            let map = self.references.map(&table);
            let map = map.lock().await;
            if ids
                .iter()
                .any(|id| map.item(*id).is_some_and(|item| item.pending))
            {
                pending.push(table);
            }
        }
        pending
    }

    async fn schema(
        &self,
        schemas: &mut HashMap<String, TableSchema>,
        table: &str,
    ) -> Result<TableSchema, SyncError> {
        if let Some(schema) = schemas.get(table) {
            return Ok(schema.clone());
        }
        let schema = self.context.store.table_schema(table).await?;
        schemas.insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    /// Resolve every included record and encode the combined document
    async fn flatten(
        &self,
        task: &Task,
        schemas: &mut HashMap<String, TableSchema>,
    ) -> Result<ExportPayload, SyncError> {
        let settings = &self.context.config.sync;
        let mut tables = Vec::new();

        for (table, ids) in self.included() {
            let records: Vec<(String, Record)> = {
                let map = self.references.map(&table);
                let map = map.lock().await;
                ids.iter()
                    .filter_map(|id| {
                        let item = map.item(*id)?;
                        Some((item.uid.clone()?, item.data.clone()?))
                    })
                    .collect()
            };
            if records.is_empty() {
                continue;
            }
            let schema = self.schema(schemas, &table).await?;

            let mut resolved = Vec::with_capacity(records.len());
            for (uid, record) in records {
                let mut fields = Map::new();
                for (name, value) in record.fields {
                    if name == settings.uid_field
                        || name == settings.sync_date_field
                        || name == settings.updated_field
                    {
                        continue;
                    }
                    let value = match schema.field(&name).map(|field| &field.kind) {
                        Some(FieldKind::ForeignKey(fk)) => {
                            self.resolve_reference(&table, &name, fk, value).await?
                        }
                        Some(FieldKind::File) => match value.as_str() {
                            Some(uri) if !uri.is_empty() => {
                                self.get_file(uri).map(Value::String).unwrap_or(Value::Null)
                            }
                            _ => Value::Null,
                        },
                        _ => value,
                    };
                    fields.insert(name, value);
                }
                resolved.push(ResolvedRecord { uid, fields });
            }
            tables.push((table, resolved));
        }

        task.notify(TaskProgress::Encoding {
            tables: tables.len(),
            records: tables.iter().map(|(_, records)| records.len()).sum(),
        });

        let mut document = Map::new();
        let mut uids = BTreeMap::new();
        for (table, records) in tables {
            let fragment = self.context.encoder.encode(&table, &records)?;
            merge_fragment(&mut document, fragment)?;
            uids.insert(table, records.into_iter().map(|record| record.uid).collect());
        }

        let attachments = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.attachments.clone()
        };

        Ok(ExportPayload {
            document: Value::Object(document),
            uids,
            attachments,
        })
    }

    async fn resolve_reference(
        &self,
        table: &str,
        field: &str,
        fk: &ForeignKey,
        value: Value,
    ) -> Result<Value, SyncError> {
        let Some(target) = local_reference(fk, Some(&value)) else {
            return Ok(value);
        };

        let lookup = {
            let map = self.references.map(&fk.target_table);
            let map = map.lock().await;
            map.lookup(target)
        };
        match lookup {
            Some(UidLookup::Resolved(uid)) => Ok(Value::String(uid)),
            Some(UidLookup::Unresolved) => {
                tracing::warn!(
                    table = %table,
                    field = %field,
                    target_table = %fk.target_table,
                    target_id = target,
                    "Exporting unresolved reference as null"
                );
                Ok(Value::Null)
            }
            Some(UidLookup::Pending) | None => Err(SyncError::Internal(anyhow::anyhow!(
                "{}.{} references {}#{} which was never loaded",
                table,
                field,
                fk.target_table,
                target
            ))),
        }
    }
}

/// Local identity held by a foreign-key value, `None` if it needs no rewriting
fn local_reference(fk: &ForeignKey, value: Option<&Value>) -> Option<RecordId> {
    if fk.target_field != LOCAL_KEY {
        return None;
    }
    match value? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MockFileStore;
    use crate::store::{Filter, SqliteStore, Store};
    use crate::sync::testing;
    use crate::transport::MockTransport;
    use serde_json::json;

    fn export_task(store: &Arc<SqliteStore>, table: &str) -> Arc<Task> {
        let context = testing::context(store.clone(), MockTransport::new(), MockFileStore::new());
        let references = Arc::new(ReferenceRegistry::new("uuid"));
        Task::new(TaskKind::DataExport(DataExport::new(
            context,
            references,
            table,
            table,
            ServerRef::new(table),
        )))
    }

    async fn upload_payload(task: &Arc<Task>) -> ExportPayload {
        let Ok(TaskOutput::Upload(upload)) = task.done().await else {
            panic!("export must resolve with an upload task");
        };
        let TaskKind::DataUpload(upload) = upload.kind() else {
            panic!("export must hand over to a data upload");
        };
        upload.payload().clone()
    }

    fn items<'a>(payload: &'a ExportPayload, table: &str) -> &'a Vec<Value> {
        payload.document[format!("$_{}", table)]
            .as_array()
            .unwrap_or_else(|| panic!("payload has no {} entry", table))
    }

    #[tokio::test]
    async fn referenced_household_is_exported_with_person() {
        let (store, _temp_dir) = testing::sqlite_store().await;
        store
            .insert(
                "household",
                &testing::fields(json!({
                    "id": 7,
                    "village": "Kisumu",
                    "updated": "2026-01-01T00:00:00.000Z",
                    "sync_date": "2026-02-01T00:00:00.000Z"
                })),
            )
            .await
            .unwrap();
        store
            .insert(
                "person",
                &testing::fields(json!({"id": 1, "name": "Amina", "household": 7})),
            )
            .await
            .unwrap();

        let payload = upload_payload(&export_task(&store, "person")).await;

        let households = items(&payload, "household");
        let persons = items(&payload, "person");
        assert_eq!(households.len(), 1);
        assert_eq!(persons.len(), 1);

        let household_uid = households[0]["@uuid"].as_str().unwrap();
        assert_eq!(persons[0]["household"], json!(household_uid));
        assert_eq!(persons[0]["name"], json!("Amina"));
        assert_eq!(households[0]["village"], json!("Kisumu"));

        // The minted identifier was written back to the local record
        let household = store.get("household", 7).await.unwrap().unwrap();
        assert_eq!(household.get_str("uuid"), Some(household_uid));

        // Local bookkeeping does not leave the device
        for item in households.iter().chain(persons) {
            let item = item.as_object().unwrap();
            assert!(!item.contains_key("uuid"));
            assert!(!item.contains_key("sync_date"));
            assert!(!item.contains_key("updated"));
            assert!(!item.contains_key("id"));
        }
        assert_eq!(payload.record_count(), 2);
    }

    #[tokio::test]
    async fn exported_records_decode_to_local_records() {
        use crate::encoder::{Encoder, JsonEncoder};

        let (store, _temp_dir) = testing::sqlite_store().await;
        let household = store
            .insert(
                "household",
                &testing::fields(json!({"village": "Kisumu", "updated": "2026-01-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();
        store
            .insert(
                "person",
                &testing::fields(json!({"name": "Amina", "household": household})),
            )
            .await
            .unwrap();

        let payload = upload_payload(&export_task(&store, "person")).await;
        let decoded = JsonEncoder::new("uuid".to_string())
            .decode(&payload.document, "person")
            .unwrap();

        let household_uid = store
            .get("household", household)
            .await
            .unwrap()
            .and_then(|record| record.get_str("uuid").map(str::to_string))
            .unwrap();
        let mut checked = 0;
        for table in decoded {
            let locals = store.query(&table.table, &Filter::All).await.unwrap();
            for remote in table.records {
                let local = locals
                    .iter()
                    .find(|local| local.get("uuid") == remote.get("uuid"))
                    .unwrap();
                let mut expected = local.fields.clone();
                expected.remove("sync_date");
                expected.remove("updated");
                if table.table == "person" {
                    expected.insert("household".to_string(), json!(household_uid));
                }
                assert_eq!(remote, expected, "{} record", table.table);
                checked += 1;
            }
        }
        assert_eq!(checked, 2);
    }

    #[tokio::test]
    async fn shared_references_are_exported_once_across_rounds() {
        let (store, _temp_dir) = testing::sqlite_store().await;
        sqlx::query(
            "CREATE TABLE visit (
                id INTEGER PRIMARY KEY,
                uuid TEXT,
                person INTEGER REFERENCES person(id),
                updated TEXT,
                sync_date TEXT
            )",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let household = store
            .insert(
                "household",
                &testing::fields(json!({"uuid": "h1", "sync_date": "2026-02-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();
        let person = store
            .insert(
                "person",
                &testing::fields(json!({
                    "uuid": "p1",
                    "household": household,
                    "sync_date": "2026-02-01T00:00:00.000Z"
                })),
            )
            .await
            .unwrap();
        for _ in 0..2 {
            store
                .insert("visit", &testing::fields(json!({"person": person})))
                .await
                .unwrap();
        }

        let task = export_task(&store, "visit");
        let mut progress = task.subscribe();
        let payload = upload_payload(&task).await;

        assert_eq!(items(&payload, "visit").len(), 2);
        assert_eq!(items(&payload, "person").len(), 1);
        assert_eq!(items(&payload, "household").len(), 1);
        assert_eq!(items(&payload, "person")[0]["household"], json!("h1"));
        for visit in items(&payload, "visit") {
            assert_eq!(visit["person"], json!("p1"));
        }

        // person is loaded in round 1, household in round 2; encoding follows
        assert!(progress.has_changed().unwrap());
        assert!(matches!(
            *progress.borrow_and_update(),
            Some(TaskProgress::Encoding { tables: 3, records: 4 })
        ));
    }

    #[tokio::test]
    async fn orphan_reference_is_exported_as_null() {
        let (store, _temp_dir) = testing::sqlite_store().await;
        store
            .insert(
                "person",
                &testing::fields(json!({"uuid": "p1", "name": "Otieno", "household": 99})),
            )
            .await
            .unwrap();

        let payload = upload_payload(&export_task(&store, "person")).await;

        assert_eq!(items(&payload, "person")[0]["household"], Value::Null);
        assert!(payload.document.get("$_household").is_none());
        assert_eq!(payload.uids.get("household"), None);
    }

    #[tokio::test]
    async fn file_fields_become_attachment_names() {
        let (store, _temp_dir) = testing::sqlite_store().await;
        store
            .insert(
                "household",
                &testing::fields(json!({
                    "uuid": "h1",
                    "photo": "file:///data/outbox/01H-door.jpg"
                })),
            )
            .await
            .unwrap();

        let payload = upload_payload(&export_task(&store, "household")).await;

        assert_eq!(items(&payload, "household")[0]["photo"], json!("01H-door.jpg"));
        assert_eq!(
            payload.attachments,
            BTreeMap::from([(
                "01H-door.jpg".to_string(),
                "file:///data/outbox/01H-door.jpg".to_string()
            )])
        );
    }

    #[tokio::test]
    async fn empty_export_uploads_nothing() {
        let (store, _temp_dir) = testing::sqlite_store().await;

        let task = export_task(&store, "person");
        let Ok(TaskOutput::Upload(upload)) = task.done().await else {
            panic!("export must resolve with an upload task");
        };

        // MockTransport has no expectations: any network call would panic
        let outcome = upload.done().await.expect("empty upload succeeds");
        let TaskOutput::Uploaded(report) = outcome else {
            panic!("upload must resolve with a report");
        };
        assert!(report.accepted.is_empty());
        assert!(report.rejected.is_empty());
        assert_eq!(report.updated, 0);
    }

    #[tokio::test]
    async fn load_failure_rejects_the_export() {
        let (store, _temp_dir) = testing::sqlite_store().await;

        let error = export_task(&store, "ghost")
            .done()
            .await
            .expect_err("unknown table must fail");
        assert!(matches!(&*error, SyncError::UnknownTable(table) if table == "ghost"));
    }

    #[test]
    fn attachment_collision_keeps_first_uri() {
        let context = testing::mock_context(MockTransport::new(), MockFileStore::new());
        let export = DataExport::new(
            context,
            Arc::new(ReferenceRegistry::new("uuid")),
            "household",
            "household",
            ServerRef::new("household"),
        );

        assert_eq!(export.get_file("file:///a/photo.jpg").as_deref(), Some("photo.jpg"));
        assert_eq!(export.get_file("file:///b/photo.jpg").as_deref(), Some("photo.jpg"));

        let state = export.state.lock().unwrap();
        assert_eq!(state.attachments["photo.jpg"], "file:///a/photo.jpg");
    }

    #[test]
    fn only_id_targets_are_rewritten() {
        let by_id = ForeignKey {
            target_table: "household".to_string(),
            target_field: "id".to_string(),
        };
        let by_uid = ForeignKey {
            target_table: "household".to_string(),
            target_field: "uuid".to_string(),
        };

        assert_eq!(local_reference(&by_id, Some(&json!(7))), Some(7));
        assert_eq!(local_reference(&by_id, Some(&json!("7"))), Some(7));
        assert_eq!(local_reference(&by_id, Some(&Value::Null)), None);
        assert_eq!(local_reference(&by_uid, Some(&json!(7))), None);
    }
}
