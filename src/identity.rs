//! Node identity: the repeater's name, keys, and hardware descriptors,
//! queried once at startup and never mutated afterward.

use serde::Serialize;

/// Everything the startup dialogue learns about the attached repeater.
///
/// Immutable once constructed — later components only ever read from it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeIdentity {
    pub name: String,
    /// Canonical uppercase hex, 64 characters.
    pub public_key: String,
    /// Hex, 128 characters. Absent when the firmware won't disclose it —
    /// token auth and command signing are then unavailable.
    pub private_key: Option<String>,
    pub radio_info: Option<String>,
    pub firmware_version: Option<String>,
    pub board_type: Option<String>,
}

impl NodeIdentity {
    pub fn can_sign(&self) -> bool {
        self.private_key.is_some()
    }
}
