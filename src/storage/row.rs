//! Row representation shared by the storage collaborator and the
//! built-in compensatable operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::RowKey;

/// a stored row with metadata and user data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// primary key
    pub key: RowKey,
    /// bumped on every write, including restores
    pub version: u64,
    /// creation timestamp
    pub created_at: String,
    /// last update timestamp
    pub updated_at: String,
    /// data (column values)
    pub data: BTreeMap<String, Value>,
}

impl Row {
    /// creates a new row with key & data
    ///
    /// sets v1 and current time
    pub fn new(key: RowKey, data: BTreeMap<String, Value>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// create a new row from a JSON object
    pub fn from_value(key: RowKey, value: Value) -> StorageResult<Self> {
        Ok(Self::new(key, object_fields(value)?))
    }

    /// merge new data into existing data (for partial updates)
    pub fn merge_data(&mut self, updates: BTreeMap<String, Value>) {
        for (k, v) in updates {
            self.data.insert(k, v);
        }
        self.touch();
    }

    /// set or remove individual fields; `None` removes the field
    pub fn restore_fields(&mut self, fields: BTreeMap<String, Option<Value>>) {
        for (k, v) in fields {
            match v {
                Some(v) => {
                    self.data.insert(k, v);
                }
                None => {
                    self.data.remove(&k);
                }
            }
        }
        self.touch();
    }

    /// get a column value by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// unpack a JSON object into column values
pub fn object_fields(value: Value) -> StorageResult<BTreeMap<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(StorageError::SchemaViolation(
            "row data must be a JSON object".to_string(),
        )),
    }
}
