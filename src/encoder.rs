//! Wire document codec
//!
//! A document is a JSON object holding one array per table under the key
//! `"$_" + table`. Every item carries its global identifier as `"@uuid"`.
//!
//! ```text
//! {
//!   "$_household": [{"@uuid": "9b2f…", "village": "Kisumu"}],
//!   "$_person":    [{"@uuid": "41c0…", "name": "Amina", "household": "9b2f…"}]
//! }
//! ```

use serde_json::{Map, Value};

use crate::error::SyncError;

/// Key holding an item's global identifier
pub const UID_KEY: &str = "@uuid";

/// Key holding a per-item error message in server responses
pub const ERROR_KEY: &str = "@error";

/// Prefix of every table key
pub const TABLE_PREFIX: &str = "$_";

/// Document key of `table`
pub fn table_key(table: &str) -> String {
    format!("{}{}", TABLE_PREFIX, table)
}

/// Table named by a document key, `None` for non-table keys
pub fn table_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(TABLE_PREFIX).filter(|table| !table.is_empty())
}

/// A record ready for the wire
///
/// Foreign keys already hold global identifiers (or null), file fields
/// hold attachment names, and local bookkeeping columns are gone.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub uid: String,
    pub fields: Map<String, Value>,
}

/// Records of one table decoded from a document
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTable {
    pub table: String,
    pub records: Vec<Map<String, Value>>,
}

pub trait Encoder: Send + Sync {
    /// Serialize resolved records of `table` into a document fragment
    fn encode(&self, table: &str, records: &[ResolvedRecord]) -> Result<Value, SyncError>;

    /// Inverse of [`Encoder::encode`]; a bare array is attributed to `default_table`
    fn decode(&self, fragment: &Value, default_table: &str)
    -> Result<Vec<DecodedTable>, SyncError>;
}

/// Merge a fragment's tables into a document
pub fn merge_fragment(document: &mut Map<String, Value>, fragment: Value) -> Result<(), SyncError> {
    let Value::Object(tables) = fragment else {
        return Err(SyncError::Encoding(
            "document fragment must be an object".to_string(),
        ));
    };

    for (key, items) in tables {
        let Value::Array(items) = items else {
            return Err(SyncError::Encoding(format!("{} must be an array", key)));
        };
        match document.get_mut(&key) {
            Some(Value::Array(existing)) => existing.extend(items),
            _ => {
                document.insert(key, Value::Array(items));
            }
        }
    }
    Ok(())
}

/// The JSON codec
#[derive(Debug, Clone)]
pub struct JsonEncoder {
    /// Local column the `"@uuid"` key maps to
    uid_field: String,
}

impl JsonEncoder {
    pub fn new(uid_field: impl Into<String>) -> Self {
        Self {
            uid_field: uid_field.into(),
        }
    }

    fn decode_item(
        &self,
        item: &Value,
        table: &str,
        out: &mut Vec<DecodedTable>,
    ) -> Result<(), SyncError> {
        let Value::Object(object) = item else {
            return Err(SyncError::Encoding(format!(
                "items of {} must be objects",
                table_key(table)
            )));
        };

        let mut record = Map::new();
        for (key, value) in object {
            if key == UID_KEY {
                record.insert(self.uid_field.clone(), value.clone());
            } else if let Some(child) = table_from_key(key) {
                // Nested child tables are lifted into their own entries
                self.decode_items(value, child, out)?;
            } else {
                record.insert(key.clone(), value.clone());
            }
        }
        push_record(out, table, record);
        Ok(())
    }

    fn decode_items(
        &self,
        items: &Value,
        table: &str,
        out: &mut Vec<DecodedTable>,
    ) -> Result<(), SyncError> {
        let Value::Array(items) = items else {
            return Err(SyncError::Encoding(format!(
                "{} must be an array",
                table_key(table)
            )));
        };
        for item in items {
            self.decode_item(item, table, out)?;
        }
        Ok(())
    }
}

fn push_record(out: &mut Vec<DecodedTable>, table: &str, record: Map<String, Value>) {
    match out.iter_mut().find(|decoded| decoded.table == table) {
        Some(decoded) => decoded.records.push(record),
        None => out.push(DecodedTable {
            table: table.to_string(),
            records: vec![record],
        }),
    }
}

impl Encoder for JsonEncoder {
    fn encode(&self, table: &str, records: &[ResolvedRecord]) -> Result<Value, SyncError> {
        let items = records
            .iter()
            .map(|record| {
                let mut item = Map::new();
                item.insert(UID_KEY.to_string(), Value::String(record.uid.clone()));
                for (key, value) in &record.fields {
                    if key == UID_KEY || key == &self.uid_field {
                        continue;
                    }
                    item.insert(key.clone(), value.clone());
                }
                Value::Object(item)
            })
            .collect();

        let mut fragment = Map::new();
        fragment.insert(table_key(table), Value::Array(items));
        Ok(Value::Object(fragment))
    }

    fn decode(
        &self,
        fragment: &Value,
        default_table: &str,
    ) -> Result<Vec<DecodedTable>, SyncError> {
        let mut out = Vec::new();
        match fragment {
            Value::Array(_) => self.decode_items(fragment, default_table, &mut out)?,
            Value::Object(tables) => {
                for (key, items) in tables {
                    if let Some(table) = table_from_key(key) {
                        self.decode_items(items, table, &mut out)?;
                    }
                }
            }
            Value::Null => {}
            _ => {
                return Err(SyncError::Encoding(
                    "document must be an object or an array".to_string(),
                ));
            }
        }
        Ok(out)
    }
}
