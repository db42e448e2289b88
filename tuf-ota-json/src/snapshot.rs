use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use std::collections::BTreeMap;
use tuf_ota_common::crypto::sha256;
use tuf_ota_common::{RoleType, Version};

/// JSON encoding of the TUF Snapshot format.
/// [Refer to the TUF specification.](https://theupdateframework.github.io/specification/latest/#file-formats-snapshot)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "snapshot")]
pub struct Snapshot {
    pub spec_version: String,
    pub version: Version,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
}

impl Snapshot {
    pub fn targets_meta(&self) -> Option<&MetaFile> {
        self.meta.get(&RoleType::Targets.metapath())
    }
}

/// Pointer from one metadata file to another.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: Version,
    pub length: u64,
    #[serde_as(as = "BTreeMap<_, Hex>")]
    pub hashes: BTreeMap<String, Vec<u8>>,
}

impl MetaFile {
    /// Describes the file `data` as version `version`.
    pub fn for_file(version: Version, data: &[u8]) -> Self {
        MetaFile {
            version,
            length: data.len() as u64,
            hashes: BTreeMap::from([("sha256".to_string(), sha256(data).to_vec())]),
        }
    }

    pub fn sha256(&self) -> Option<&[u8]> {
        self.hashes.get("sha256").map(Vec::as_slice)
    }
}
