//! Node number formatting and parsing.
//!
//! Meshtastic identifies nodes by a 32-bit number, shown to users as `!` followed
//! by eight lowercase hex digits. `0xffffffff` is the broadcast address.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Destination value meaning "every node on the channel".
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid node id '{0}' (expected !xxxxxxxx, 0xXXXXXXXX or a decimal number)")]
pub struct NodeIdParseError(String);

impl NodeId {
    pub fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_NUM
    }

    /// Compact destination label used in packet lists (`^all` for broadcast).
    pub fn short_label(self) -> String {
        if self.is_broadcast() {
            "^all".to_string()
        } else {
            self.to_string()
        }
    }

    /// Descriptive destination label used in detail views.
    pub fn describe(self) -> String {
        if self.is_broadcast() {
            "broadcast".to_string()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(num: u32) -> Self {
        NodeId(num)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = if let Some(hex) = trimmed.strip_prefix('!') {
            if hex.len() != 8 {
                return Err(NodeIdParseError(s.to_string()));
            }
            u32::from_str_radix(hex, 16)
        } else if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            u32::from_str_radix(hex, 16)
        } else if trimmed == "^all" {
            Ok(BROADCAST_NUM)
        } else {
            trimmed.parse::<u32>()
        };
        parsed
            .map(NodeId)
            .map_err(|_| NodeIdParseError(s.to_string()))
    }
}

/// Shorthand for `NodeId(num).to_string()`.
pub fn format_node_id(num: u32) -> String {
    NodeId(num).to_string()
}

pub fn is_broadcast(num: u32) -> bool {
    num == BROADCAST_NUM
}
