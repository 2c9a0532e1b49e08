//! Tag identifiers.
//!
//! Readers report a tag's UID as a handful of bytes. The canonical form used as a
//! lookup key is upper-case hex without separators (`880472D729`).
use std::fmt;

use serde::{Deserialize, Serialize};

/// UID of the debug tag shipped in the default lookup table.
pub const DEBUG_TAG: &str = "880472D729";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(String);

impl TagId {
    pub fn from_bytes(uid: &[u8]) -> Self {
        Self(uid.iter().map(|b| format!("{:02X}", b)).collect())
    }

    /// Parse a UID as printed by reader modules.
    ///
    /// Accepts hex with optional `:`/`-`/space separators (`88:04:72:D7:29`) and
    /// decimal byte lists (`[136, 4, 114, 215, 41]`). Returns `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            let bytes: Option<Vec<u8>> = inner
                .split(',')
                .map(|part| part.trim().parse::<u8>().ok())
                .collect();
            return bytes.filter(|b| !b.is_empty()).map(|b| Self::from_bytes(&b));
        }
        let hex: String = text
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .collect();
        if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(hex.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
