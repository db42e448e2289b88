use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{hex::Hex, serde_as};
use std::collections::BTreeMap;
use tuf_ota_common::crypto::sha256;
use tuf_ota_common::Version;

/// JSON encoding of the TUF Targets format, without delegations.
/// [Refer to the TUF specification.](https://theupdateframework.github.io/specification/latest/#file-formats-targets)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "targets")]
pub struct Targets {
    pub spec_version: String,
    pub version: Version,
    pub expires: DateTime<Utc>,
    /// Target files by path.
    pub targets: BTreeMap<String, TargetFile>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFile {
    pub length: u64,
    #[serde_as(as = "BTreeMap<_, Hex>")]
    pub hashes: BTreeMap<String, Vec<u8>>,
    /// Opaque application data, for example the version a patch applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl TargetFile {
    pub fn from_bytes(data: &[u8], custom: Option<Value>) -> Self {
        TargetFile {
            length: data.len() as u64,
            hashes: BTreeMap::from([("sha256".to_string(), sha256(data).to_vec())]),
            custom,
        }
    }

    pub fn sha256(&self) -> Option<&[u8]> {
        self.hashes.get("sha256").map(Vec::as_slice)
    }
}
