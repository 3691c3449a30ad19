//! Device and uid primitives
//!
//! A device names one tree namespace: a local volume subtree or a cloud
//! account. Every node uid is scoped to its device; the pair
//! `(device_uid, uid)` is globally unique.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal monotonic identifier for a node, scoped to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub i64);

impl Uid {
    pub const NULL: Uid = Uid(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Uid {
    fn from(value: i64) -> Self {
        Uid(value)
    }
}

/// Identifier for a device (tree namespace), issued by the registry database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceUid(pub i64);

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for DeviceUid {
    fn from(value: i64) -> Self {
        DeviceUid(value)
    }
}

/// The kind of tree a device exposes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum TreeType {
    /// A local POSIX filesystem subtree. Nodes have exactly one path and parent.
    LocalDisk = 1,
    /// A cloud drive namespace. Nodes may have multiple parents and paths.
    Cloud = 2,
}

impl TreeType {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl From<i32> for TreeType {
    fn from(value: i32) -> Self {
        match value {
            2 => TreeType::Cloud,
            _ => TreeType::LocalDisk,
        }
    }
}

/// A registered tree namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub uid: DeviceUid,
    pub tree_type: TreeType,
    /// Local: absolute subtree root path. Cloud: account label.
    pub label: String,
}

impl Device {
    pub fn new(uid: DeviceUid, tree_type: TreeType, label: impl Into<String>) -> Self {
        Self {
            uid,
            tree_type,
            label: label.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.tree_type == TreeType::LocalDisk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_type_round_trips_through_i32() {
        assert_eq!(TreeType::from(TreeType::LocalDisk.as_i32()), TreeType::LocalDisk);
        assert_eq!(TreeType::from(TreeType::Cloud.as_i32()), TreeType::Cloud);
    }

    #[test]
    fn null_uid_is_recognized() {
        assert!(Uid::NULL.is_null());
        assert!(!Uid(7).is_null());
    }
}
