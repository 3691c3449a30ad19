//! Uid registry
//!
//! Issues strictly increasing node uids per device and keeps bidirectional
//! maps between internal uids and external keys (absolute paths for local
//! trees, provider item ids for cloud trees), so repeated observations of
//! the same real-world object resolve to the same uid across restarts.

use crate::device::{DeviceUid, Uid};
use crate::node::identifier::normalize_path;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// First uid handed out on a fresh device. Uid 1 is reserved for the tree root.
const FIRST_UID: i64 = 1;

#[derive(Default)]
struct KeyMaps {
    key_to_uid: HashMap<String, Uid>,
    uid_to_key: HashMap<Uid, String>,
}

/// Per-device uid issuer and external-key mapper.
pub struct UidRegistry {
    device_uid: DeviceUid,
    next_uid: AtomicI64,
    paths: Mutex<KeyMaps>,
    external_ids: Mutex<KeyMaps>,
}

impl UidRegistry {
    pub fn new(device_uid: DeviceUid) -> Self {
        Self {
            device_uid,
            next_uid: AtomicI64::new(FIRST_UID),
            paths: Mutex::new(KeyMaps::default()),
            external_ids: Mutex::new(KeyMaps::default()),
        }
    }

    pub fn device_uid(&self) -> DeviceUid {
        self.device_uid
    }

    /// Issue a fresh, strictly increasing uid.
    pub fn next_uid(&self) -> Uid {
        Uid(self.next_uid.fetch_add(1, Ordering::SeqCst))
    }

    /// Raise the issue floor so freshly issued uids cannot collide with uids
    /// already present in a loaded persistent index.
    pub fn ensure_next_greater_than(&self, n: i64) {
        self.next_uid.fetch_max(n + 1, Ordering::SeqCst);
    }

    /// Resolve the uid for an absolute local path, allocating one if the
    /// path has never been seen. A `suggested_uid` (typically read back from
    /// the persistent index) is bound if it is unused; a conflicting
    /// suggestion is ignored with a warning.
    pub fn uid_for_path(&self, path: &str, suggested_uid: Option<Uid>) -> Uid {
        let key = normalize_path(path);
        self.resolve(&self.paths, key, suggested_uid)
    }

    /// Resolve the uid for a provider-assigned external id.
    pub fn uid_for_external_id(&self, external_id: &str, suggested_uid: Option<Uid>) -> Uid {
        self.resolve(&self.external_ids, external_id.to_string(), suggested_uid)
    }

    pub fn path_for_uid(&self, uid: Uid) -> Option<String> {
        self.paths.lock().unwrap().uid_to_key.get(&uid).cloned()
    }

    pub fn external_id_for_uid(&self, uid: Uid) -> Option<String> {
        self.external_ids.lock().unwrap().uid_to_key.get(&uid).cloned()
    }

    /// Rebind a uid to a new path after a move. The old path mapping is
    /// dropped so a later node at the old path allocates a fresh uid.
    pub fn update_path_for_uid(&self, uid: Uid, new_path: &str) {
        let mut maps = self.paths.lock().unwrap();
        if let Some(old) = maps.uid_to_key.remove(&uid) {
            maps.key_to_uid.remove(&old);
        }
        let key = normalize_path(new_path);
        maps.key_to_uid.insert(key.clone(), uid);
        maps.uid_to_key.insert(uid, key);
    }

    fn resolve(&self, maps: &Mutex<KeyMaps>, key: String, suggested_uid: Option<Uid>) -> Uid {
        let mut maps = maps.lock().unwrap();

        if let Some(existing) = maps.key_to_uid.get(&key) {
            if let Some(suggested) = suggested_uid {
                if suggested != *existing {
                    warn!(
                        device = %self.device_uid,
                        key = %key,
                        "Suggested uid {suggested} conflicts with existing {existing}; keeping existing"
                    );
                }
            }
            return *existing;
        }

        let uid = match suggested_uid {
            Some(suggested) if !maps.uid_to_key.contains_key(&suggested) => {
                self.ensure_next_greater_than(suggested.0);
                suggested
            }
            Some(suggested) => {
                warn!(
                    device = %self.device_uid,
                    key = %key,
                    "Suggested uid {suggested} already bound to another key; allocating fresh"
                );
                self.next_uid()
            }
            None => self.next_uid(),
        };

        maps.key_to_uid.insert(key.clone(), uid);
        maps.uid_to_key.insert(uid, key);
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_are_strictly_increasing() {
        let registry = UidRegistry::new(DeviceUid(1));
        let a = registry.next_uid();
        let b = registry.next_uid();
        assert!(b.0 > a.0);
    }

    #[test]
    fn same_path_resolves_to_same_uid() {
        let registry = UidRegistry::new(DeviceUid(1));
        let a = registry.uid_for_path("/home/x/file.txt", None);
        let b = registry.uid_for_path("/home/x/file.txt/", None);
        assert_eq!(a, b);
    }

    #[test]
    fn suggested_uid_is_bound_when_free() {
        let registry = UidRegistry::new(DeviceUid(1));
        let uid = registry.uid_for_path("/a", Some(Uid(500)));
        assert_eq!(uid, Uid(500));
        // The floor moved past the suggestion:
        assert!(registry.next_uid().0 > 500);
    }

    #[test]
    fn conflicting_suggestion_is_ignored() {
        let registry = UidRegistry::new(DeviceUid(1));
        let first = registry.uid_for_path("/a", Some(Uid(10)));
        let second = registry.uid_for_path("/b", Some(Uid(10)));
        assert_eq!(first, Uid(10));
        assert_ne!(second, Uid(10));
    }

    #[test]
    fn ensure_next_greater_than_prevents_collisions() {
        let registry = UidRegistry::new(DeviceUid(1));
        registry.ensure_next_greater_than(1000);
        assert!(registry.next_uid().0 > 1000);
        // Lowering the floor is a no-op:
        registry.ensure_next_greater_than(5);
        assert!(registry.next_uid().0 > 1000);
    }

    #[test]
    fn move_rebinds_path() {
        let registry = UidRegistry::new(DeviceUid(1));
        let uid = registry.uid_for_path("/a/old", None);
        registry.update_path_for_uid(uid, "/a/new");
        assert_eq!(registry.uid_for_path("/a/new", None), uid);
        assert_ne!(registry.uid_for_path("/a/old", None), uid);
    }
}
