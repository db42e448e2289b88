use crate::{Key, KeyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tuf_ota_common::{RoleType, Threshold, Version};

/// JSON encoding of a TUF root file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "root")]
pub struct Root {
    /// Version of the TUF spec.
    pub spec_version: String,
    /// Whether snapshot and targets files are also published under `{version}.{role}.json`.
    pub consistent_snapshot: bool,
    /// Version of the root file.
    pub version: Version,
    pub expires: DateTime<Utc>,
    /// Keys by key ID.
    pub keys: BTreeMap<KeyId, Key>,
    /// Key assignment and threshold per role.
    pub roles: BTreeMap<RoleType, Role>,
}

/// The keys that are associated with a role and how many of them have to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub keyids: Vec<KeyId>,
    pub threshold: Threshold,
}

impl Root {
    /// The keys of `role`, only counting entries whose key ID matches the key.
    pub fn role_keys(&self, role: RoleType) -> Option<BTreeMap<KeyId, &Key>> {
        let role = self.roles.get(&role)?;
        Some(
            role.keyids
                .iter()
                .filter_map(|key_id| {
                    let key = self.keys.get(key_id)?;
                    (key.key_id().ok()? == *key_id).then_some((*key_id, key))
                })
                .collect(),
        )
    }

    pub fn role_threshold(&self, role: RoleType) -> Option<Threshold> {
        self.roles.get(&role).map(|r| r.threshold)
    }
}
