use crate::snapshot::MetaFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tuf_ota_common::{RoleType, Version};

/// JSON encoding of the TUF Timestamp format.
/// [Refer to the TUF specification.](https://theupdateframework.github.io/specification/latest/#file-formats-timestamp)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "timestamp")]
pub struct Timestamp {
    pub spec_version: String,
    pub version: Version,
    pub expires: DateTime<Utc>,
    /// Holds exactly one entry, `snapshot.json`.
    pub meta: BTreeMap<String, MetaFile>,
}

impl Timestamp {
    pub fn snapshot_meta(&self) -> Option<&MetaFile> {
        self.meta.get(&RoleType::Snapshot.metapath())
    }
}
