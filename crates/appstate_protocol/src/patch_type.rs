//! Named mutation collections.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an independently versioned mutation collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchType {
    /// Block list changes that must be applied before anything else.
    CriticalBlock,
    /// Unblock and low-priority critical settings.
    CriticalUnblockLow,
    /// High-priority regular settings.
    RegularHigh,
    /// Regular settings (archive, pin, mute, ...).
    Regular,
    /// Low-priority regular settings.
    RegularLow,
}

impl PatchType {
    /// Every patch type, critical ones first in their required order.
    pub const ALL: [PatchType; 5] = [
        PatchType::CriticalBlock,
        PatchType::CriticalUnblockLow,
        PatchType::RegularHigh,
        PatchType::Regular,
        PatchType::RegularLow,
    ];

    /// The two critical types, in the order they must be synchronized.
    pub const CRITICAL: [PatchType; 2] = [PatchType::CriticalBlock, PatchType::CriticalUnblockLow];

    /// Returns the wire name of this collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchType::CriticalBlock => "critical_block",
            PatchType::CriticalUnblockLow => "critical_unblock_low",
            PatchType::RegularHigh => "regular_high",
            PatchType::Regular => "regular",
            PatchType::RegularLow => "regular_low",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> ProtocolResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|pt| pt.as_str() == name)
            .ok_or_else(|| ProtocolError::UnknownPatchType(name.to_string()))
    }

    /// Returns true for the two collections that are always synced first.
    pub fn is_critical(&self) -> bool {
        Self::CRITICAL.contains(self)
    }
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for pt in PatchType::ALL {
            assert_eq!(PatchType::from_name(pt.as_str()).unwrap(), pt);
        }
        assert!(PatchType::from_name("regular_medium").is_err());
    }

    #[test]
    fn critical_types() {
        assert!(PatchType::CriticalBlock.is_critical());
        assert!(PatchType::CriticalUnblockLow.is_critical());
        assert!(!PatchType::Regular.is_critical());
        assert_eq!(&PatchType::ALL[..2], &PatchType::CRITICAL[..]);
    }
}
