//! Reference maps
//!
//! A [`ReferenceMap`] turns local record identities of one table into
//! global identifiers that are safe to embed as foreign keys, and holds the
//! data of every record it has loaded. Maps live in a run-scoped
//! [`ReferenceRegistry`], so a record referenced by several exports in the
//! same run is loaded and minted once.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::error::SyncError;
use crate::store::{Filter, Record, RecordId, Store};

/// Answer to a global-identifier lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidLookup {
    Resolved(String),
    /// Queued; available after the map's next load
    Pending,
    /// The record does not exist locally (orphan foreign key)
    Unresolved,
}

/// Which records a load fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadScope {
    /// Every record of the table that is new or modified since its last sync
    Modified,
    /// Exactly the pending record identities accumulated so far
    Pending,
}

/// One entry of a reference map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceItem {
    /// `None` once loaded means the record does not exist
    pub data: Option<Record>,
    pub uid: Option<String>,
    pub pending: bool,
}

/// Resolver for one table
#[derive(Debug)]
pub struct ReferenceMap {
    table: String,
    uid_field: String,
    items: BTreeMap<RecordId, ReferenceItem>,
}

impl ReferenceMap {
    pub fn new(table: impl Into<String>, uid_field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            uid_field: uid_field.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Global identifier of `id`, queueing the record if it is unknown
    ///
    /// Repeated lookups of an unknown record share one pending entry.
    pub fn get_uid(&mut self, id: RecordId) -> UidLookup {
        match self.items.get(&id) {
            Some(item) if item.pending => UidLookup::Pending,
            Some(item) => match &item.uid {
                Some(uid) => UidLookup::Resolved(uid.clone()),
                None => UidLookup::Unresolved,
            },
            None => {
                self.items.insert(
                    id,
                    ReferenceItem {
                        pending: true,
                        ..ReferenceItem::default()
                    },
                );
                UidLookup::Pending
            }
        }
    }

    /// Like [`ReferenceMap::get_uid`] without queueing; `None` if never requested
    pub fn lookup(&self, id: RecordId) -> Option<UidLookup> {
        let item = self.items.get(&id)?;
        Some(if item.pending {
            UidLookup::Pending
        } else {
            match &item.uid {
                Some(uid) => UidLookup::Resolved(uid.clone()),
                None => UidLookup::Unresolved,
            }
        })
    }

    pub fn has_pending_items(&self) -> bool {
        self.items.values().any(|item| item.pending)
    }

    pub fn pending_ids(&self) -> Vec<RecordId> {
        self.items
            .iter()
            .filter(|(_, item)| item.pending)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn item(&self, id: RecordId) -> Option<&ReferenceItem> {
        self.items.get(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Load records from the store
    ///
    /// Records without a global identifier get a freshly minted one, which
    /// is written back to the store before the map exposes it. Pending
    /// identities the store does not return become unresolved entries.
    ///
    /// # Returns
    /// Identities of the records that were loaded
    pub async fn load(
        &mut self,
        store: &dyn Store,
        scope: LoadScope,
    ) -> Result<Vec<RecordId>, SyncError> {
        let requested = match scope {
            LoadScope::Modified => Vec::new(),
            LoadScope::Pending => self.pending_ids(),
        };
        let filter = match scope {
            LoadScope::Modified => Filter::ModifiedSinceSync,
            LoadScope::Pending if requested.is_empty() => return Ok(Vec::new()),
            LoadScope::Pending => Filter::Ids(requested.clone()),
        };

        let records = store.query(&self.table, &filter).await?;

        let mut loaded = Vec::with_capacity(records.len());
        let mut resolved = Vec::with_capacity(records.len());
        for mut record in records {
            let uid = match record.get_str(&self.uid_field) {
                Some(uid) => uid.to_string(),
                None => {
                    let uid = Uuid::new_v4().to_string();
                    let mut fields = Map::new();
                    fields.insert(self.uid_field.clone(), Value::String(uid.clone()));
                    store
                        .update(&self.table, &Filter::Ids(vec![record.id]), &fields)
                        .await?;
                    tracing::debug!(
                        table = %self.table,
                        record_id = record.id,
                        uid = %uid,
                        "Minted global identifier"
                    );
                    record
                        .fields
                        .insert(self.uid_field.clone(), Value::String(uid.clone()));
                    uid
                }
            };
            loaded.push(record.id);
            resolved.push((record, uid));
        }

        for (record, uid) in resolved {
            self.items.insert(
                record.id,
                ReferenceItem {
                    data: Some(record),
                    uid: Some(uid),
                    pending: false,
                },
            );
        }

        for id in requested {
            if let Some(item) = self.items.get_mut(&id) {
                if item.pending {
                    tracing::warn!(
                        table = %self.table,
                        record_id = id,
                        "Referenced record does not exist locally; reference left unresolved"
                    );
                    item.pending = false;
                }
            }
        }

        tracing::debug!(
            table = %self.table,
            ?scope,
            loaded = loaded.len(),
            "Reference map loaded"
        );
        Ok(loaded)
    }
}

/// Reference map guarded for use across concurrent loads
pub type SharedReferenceMap = Arc<tokio::sync::Mutex<ReferenceMap>>;

/// Run-scoped cache of reference maps, keyed by table name
#[derive(Debug)]
pub struct ReferenceRegistry {
    uid_field: String,
    maps: Mutex<BTreeMap<String, SharedReferenceMap>>,
}

impl ReferenceRegistry {
    pub fn new(uid_field: impl Into<String>) -> Self {
        Self {
            uid_field: uid_field.into(),
            maps: Mutex::new(BTreeMap::new()),
        }
    }

    /// Map of `table`, created on first use
    pub fn map(&self, table: &str) -> SharedReferenceMap {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.entry(table.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(ReferenceMap::new(
                    table,
                    self.uid_field.clone(),
                )))
            })
            .clone()
    }

    pub fn tables(&self) -> Vec<String> {
        let maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.keys().cloned().collect()
    }
}
