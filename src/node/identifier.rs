//! Node identifiers
//!
//! Every node carries a composite identifier: the device it lives on, its
//! device-scoped uid, and the one-or-more absolute paths at which it is
//! reachable. Cloud nodes may be reachable under several parents; local
//! nodes always have exactly one path.

use crate::device::{DeviceUid, Uid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalize an absolute path: strip any trailing slash except for root.
pub fn normalize_path(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

/// Last path segment of a normalized absolute path.
pub fn path_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a normalized absolute path, or None for root.
pub fn path_parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a parent path and a child name.
pub fn path_join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentifier {
    pub device_uid: DeviceUid,
    pub uid: Uid,
    /// All absolute paths at which the node is reachable. Local nodes have
    /// exactly one entry; cloud nodes have one per parent chain.
    pub path_list: Vec<String>,
}

impl NodeIdentifier {
    pub fn new(device_uid: DeviceUid, uid: Uid, path: impl Into<String>) -> Self {
        Self {
            device_uid,
            uid,
            path_list: vec![normalize_path(&path.into())],
        }
    }

    pub fn with_paths(device_uid: DeviceUid, uid: Uid, path_list: Vec<String>) -> Self {
        Self {
            device_uid,
            uid,
            path_list: path_list.iter().map(|p| normalize_path(p)).collect(),
        }
    }

    /// The single path of this node. Valid for local nodes and for cloud
    /// nodes with exactly one parent chain; otherwise returns the first.
    pub fn single_path(&self) -> &str {
        self.path_list.first().map(String::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        path_name(self.single_path())
    }

    /// Globally stable identifier: `device:uid:path_index`.
    pub fn guid(&self, path_index: usize) -> String {
        format!("{}:{}:{}", self.device_uid, self.uid, path_index)
    }

    pub fn has_path(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.path_list.iter().any(|p| *p == normalized)
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} @ {:?}", self.device_uid, self.uid, self.path_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_slash() {
        assert_eq!(normalize_path("/a/b/"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn path_helpers() {
        assert_eq!(path_name("/a/b/c.txt"), "c.txt");
        assert_eq!(path_parent("/a/b"), Some("/a"));
        assert_eq!(path_parent("/a"), Some("/"));
        assert_eq!(path_parent("/"), None);
        assert_eq!(path_join("/", "x"), "/x");
        assert_eq!(path_join("/a", "x"), "/a/x");
    }

    #[test]
    fn guid_format() {
        let id = NodeIdentifier::new(DeviceUid(3), Uid(41), "/tmp/f");
        assert_eq!(id.guid(0), "3:41:0");
    }
}
