//! Store data models
//!
//! Records are dynamic: a local numeric identity plus a JSON field map,
//! typed only by the table's [`TableSchema`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sync::{JobStatus, JobType, SyncMode};

// =============================================================================
// Records
// =============================================================================

/// Local (auto-incrementing) record identity
pub type RecordId = i64;

/// A row of a synchronized table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Every column of the row except `id`
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: RecordId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of `field`, `None` when absent, null or empty
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Record selection understood by every [`crate::store::Store`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every record in the table
    All,
    /// Records never synchronized or modified after their last sync
    ModifiedSinceSync,
    /// Records with the given local identities
    Ids(Vec<RecordId>),
    /// Records with the given global identifiers
    Uids(Vec<String>),
}

impl Filter {
    /// Whether the filter can only ever match nothing
    pub fn is_empty_selection(&self) -> bool {
        match self {
            Filter::Ids(ids) => ids.is_empty(),
            Filter::Uids(uids) => uids.is_empty(),
            Filter::All | Filter::ModifiedSinceSync => false,
        }
    }

    /// Split id selections into filters of at most `size` ids each
    pub fn chunks(&self, size: usize) -> Vec<Filter> {
        match self {
            Filter::Ids(ids) => ids.chunks(size).map(|ids| Filter::Ids(ids.to_vec())).collect(),
            Filter::Uids(uids) => uids
                .chunks(size)
                .map(|uids| Filter::Uids(uids.to_vec()))
                .collect(),
            other => vec![other.clone()],
        }
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Foreign-key target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub target_table: String,
    pub target_field: String,
}

/// How a field is treated when a record is exported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Value,
    ForeignKey(ForeignKey),
    /// Holds the local URI of an attachment
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

/// Field layout of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKey> {
        match &self.field(name)?.kind {
            FieldKind::ForeignKey(fk) => Some(fk),
            _ => None,
        }
    }

    /// (field, target) pairs of every foreign key
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&str, &ForeignKey)> {
        self.fields.iter().filter_map(|field| match &field.kind {
            FieldKind::ForeignKey(fk) => Some((field.name.as_str(), fk)),
            _ => None,
        })
    }

    pub fn file_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|field| field.kind == FieldKind::File)
            .map(|field| field.name.as_str())
    }
}

// =============================================================================
// Sync log
// =============================================================================

/// Terminal outcome recorded in the sync log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncResult {
    Success,
    Error,
    Cancelled,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Log result of a terminal job status, `None` for non-terminal ones
    pub fn from_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Success => Some(Self::Success),
            JobStatus::Error => Some(Self::Error),
            JobStatus::Cancelled => Some(Self::Cancelled),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One terminal job transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub run_id: String,
    pub job_id: String,
    pub resource: String,
    pub table: String,
    pub job_type: JobType,
    pub mode: SyncMode,
    pub result: SyncResult,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}
