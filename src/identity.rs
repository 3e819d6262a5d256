//! Identity tokens - cheap stand-ins for file content

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::hashing::sha256_hex;

/// Change-identity of a file: its modification time, or a content
/// fingerprint when no usable mtime exists.
///
/// Two files with equal mtimes compare equal even when their content
/// differs. Cache reuse is keyed on this, not on content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum Identity {
    /// Milliseconds relative to the Unix epoch; negative before it.
    Mtime(i64),
    /// SHA-256 hex digest of the content.
    Fingerprint(String),
}

impl Identity {
    /// Identity from a modification time. `None` only when the offset
    /// does not fit in an `i64` of milliseconds.
    pub fn from_mtime(mtime: SystemTime) -> Option<Self> {
        let millis = match mtime.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_millis()).ok()?,
            Err(before) => -i64::try_from(before.duration().as_millis()).ok()?,
        };
        Some(Identity::Mtime(millis))
    }

    pub fn from_content(content: &[u8]) -> Self {
        Identity::Fingerprint(sha256_hex(content))
    }

    /// Mtime when available, otherwise the content fingerprint.
    pub fn from_mtime_or_content(mtime: Option<SystemTime>, content: &[u8]) -> Self {
        mtime
            .and_then(Self::from_mtime)
            .unwrap_or_else(|| Self::from_content(content))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Mtime(ms) => write!(f, "mtime:{}", ms),
            Identity::Fingerprint(hash) => write!(f, "sha256:{}", &hash[..hash.len().min(12)]),
        }
    }
}
