//! Persistent record stores for prepared and instance images.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{VaultError, VaultResult};
use crate::image::VMImage;
use crate::query::{Query, QueryType};

/// One cached artifact: the image, the query that produced it, and when it
/// was last handed out.
#[derive(Clone, Debug)]
pub struct VaultRecord {
    pub image: VMImage,
    pub query: Query,
    pub last_accessed: DateTime<Utc>,
}

/// One of the two on-disk record maps, together with its file path.
///
/// Loading is lenient: an unreadable or malformed store starts empty.
/// Saving rewrites the whole map atomically (temp file in the destination
/// directory, then rename), so a crash never leaves a half-written store.
pub struct RecordStore {
    path: PathBuf,
    pub records: HashMap<String, VaultRecord>,
}

impl RecordStore {
    pub fn load(path: PathBuf) -> Self {
        let records = read_records(&path).unwrap_or_default();
        Self { path, records }
    }

    pub fn save(&self) -> VaultResult<()> {
        let persist_error = |reason: String| VaultError::Persist {
            path: self.path.clone(),
            reason,
        };

        let stored: HashMap<&str, StoredRecord> = self
            .records
            .iter()
            .map(|(key, record)| (key.as_str(), StoredRecord::from(record)))
            .collect();
        let json =
            serde_json::to_vec_pretty(&stored).map_err(|e| persist_error(e.to_string()))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| persist_error(e.to_string()))?;
        staged
            .write_all(&json)
            .map_err(|e| persist_error(e.to_string()))?;
        staged
            .persist(&self.path)
            .map_err(|e| persist_error(e.to_string()))?;

        Ok(())
    }
}

fn read_records(path: &Path) -> Option<HashMap<String, VaultRecord>> {
    let bytes = std::fs::read(path).ok()?;
    let stored: HashMap<String, StoredRecord> = serde_json::from_slice(&bytes).ok()?;
    Some(
        stored
            .into_iter()
            .map(|(key, record)| (key, record.into_record()))
            .collect(),
    )
}

// ============================================================================
// STORED FORM
// ============================================================================

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    image: VMImage,
    query: StoredQuery,
    /// Nanoseconds since the Unix epoch; 0 or absent means "now" at load.
    #[serde(default)]
    last_accessed: i64,
}

impl StoredRecord {
    fn from(record: &VaultRecord) -> Self {
        Self {
            image: record.image.clone(),
            query: StoredQuery {
                release: record.query.release.clone(),
                persistent: record.query.persistent,
                remote_name: record.query.remote_name.clone(),
                query_type: Some(record.query.query_type),
                query_type_compat: None,
            },
            last_accessed: record.last_accessed.timestamp_nanos_opt().unwrap_or(0),
        }
    }

    fn into_record(self) -> VaultRecord {
        let last_accessed = if self.last_accessed == 0 {
            Utc::now()
        } else {
            DateTime::from_timestamp_nanos(self.last_accessed)
        };

        VaultRecord {
            image: self.image,
            query: Query {
                name: String::new(),
                release: self.query.release,
                persistent: self.query.persistent,
                remote_name: self.query.remote_name,
                query_type: self
                    .query
                    .query_type
                    .or(self.query.query_type_compat)
                    .unwrap_or(QueryType::Alias),
            },
            last_accessed,
        }
    }
}

/// Query portion of a stored record. The instance name is deliberately not
/// persisted; reloaded queries are catalog-only.
#[derive(Deserialize)]
struct StoredQuery {
    release: String,
    persistent: bool,
    #[serde(default)]
    remote_name: String,
    #[serde(default)]
    query_type: Option<QueryType>,
    /// Stores written by older tooling used the key `"type"`.
    #[serde(rename = "type", default)]
    query_type_compat: Option<QueryType>,
}

impl Serialize for StoredQuery {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let query_type = self.query_type.or(self.query_type_compat);
        // Written under both keys so either reader convention can load it.
        let mut state = serializer.serialize_struct("StoredQuery", 5)?;
        state.serialize_field("release", &self.release)?;
        state.serialize_field("persistent", &self.persistent)?;
        state.serialize_field("remote_name", &self.remote_name)?;
        state.serialize_field("query_type", &query_type)?;
        state.serialize_field("type", &query_type)?;
        state.end()
    }
}
