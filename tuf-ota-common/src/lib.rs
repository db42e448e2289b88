pub mod crypto;
pub mod error;
pub mod remote;
pub mod storage;

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

pub use error::{ErrorKind, TufError};

/// Version number of a metadata file. Versions start at 1.
pub type Version = u32;

/// Number of distinct signatures required for a role.
pub type Threshold = u8;

/// The four top-level TUF roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Root,
    Snapshot,
    Targets,
    Timestamp,
}

impl RoleType {
    pub const ALL: [RoleType; 4] = [
        RoleType::Root,
        RoleType::Timestamp,
        RoleType::Snapshot,
        RoleType::Targets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Snapshot => "snapshot",
            RoleType::Targets => "targets",
            RoleType::Timestamp => "timestamp",
        }
    }

    /// Name under which the role is listed in snapshot and timestamp metadata.
    pub fn metapath(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = TufError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(RoleType::Root),
            "snapshot" => Ok(RoleType::Snapshot),
            "targets" => Ok(RoleType::Targets),
            "timestamp" => Ok(RoleType::Timestamp),
            other => Err(TufError::DecodingError(format!("unknown role `{other}`"))),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::RoleType;

    #[test]
    fn test_role_names() {
        for role in RoleType::ALL {
            assert_eq!(role.as_str().parse::<RoleType>().unwrap(), role);
        }
        assert_eq!(RoleType::Snapshot.metapath(), "snapshot.json");
        assert!("delegation".parse::<RoleType>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let encoded = serde_json::to_string(&RoleType::Timestamp).unwrap();
        assert_eq!(encoded, "\"timestamp\"");
        let decoded: RoleType = serde_json::from_str("\"targets\"").unwrap();
        assert_eq!(decoded, RoleType::Targets);
    }
}
