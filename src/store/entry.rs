//! Cache entry

use crate::tx::Version;
use serde::{Deserialize, Serialize};

/// A versioned key. `value == None` is a tombstone left by a removal, kept so
/// that replicas can order the removal against concurrent writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub version: Version,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: Option<Vec<u8>>, version: Version) -> Self {
        Self {
            key: key.into(),
            value,
            version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
