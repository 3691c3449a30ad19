//! Content-first diff engine
//!
//! Compares two tree snapshots by content hash first: a file with the same
//! signature somewhere in each tree is the same file, wherever it sits. Only
//! then do paths matter, to tell moves, duplicates, and in-place updates
//! apart. The order of left and right is not significant: changes are
//! computed from each side's perspective (a file present only on the left is
//! ADDED from the left's perspective and a logical DELETED "ghost" from the
//! right's).
//!
//! Categories are tags on diff entries, never node subtypes; the nodes
//! themselves stay immutable.

use crate::memory::MemoryIndex;
use crate::node::identifier::normalize_path;
use crate::node::FileNode;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Diff category of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Category {
    Na,
    Ignored,
    Added,
    Deleted,
    Updated,
    Moved,
    Unchanged,
}

/// One categorized node on one side of the diff.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub node: FileNode,
    pub category: Category,
    /// For MOVED entries: the path on the other side of the rename.
    pub prev_path: Option<String>,
    /// True for logical entries mirroring the other side (a deletion that
    /// would have to happen here for the trees to converge). Ghosts are not
    /// real nodes and never carry a valid uid on this side.
    pub ghost: bool,
}

impl DiffEntry {
    fn real(node: FileNode, category: Category) -> Self {
        Self {
            node,
            category,
            prev_path: None,
            ghost: false,
        }
    }

    fn ghost(node: FileNode, category: Category) -> Self {
        Self {
            node,
            category,
            prev_path: None,
            ghost: true,
        }
    }
}

/// All categorized entries for one side.
#[derive(Debug, Clone)]
pub struct DiffSide {
    pub root_path: String,
    pub entries: Vec<DiffEntry>,
}

impl DiffSide {
    pub fn category_counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.category).or_insert(0) += 1;
        }
        counts
    }

    /// Compact summary in a stable order, e.g. `added:2 moved:1`.
    pub fn summary_string(&self) -> String {
        let counts = self.category_counts();
        let mut parts = Vec::new();
        for category in [
            Category::Added,
            Category::Deleted,
            Category::Updated,
            Category::Moved,
            Category::Unchanged,
            Category::Ignored,
        ] {
            if let Some(count) = counts.get(&category) {
                parts.push(format!("{}:{count}", category.to_string().to_lowercase()));
            }
        }
        if parts.is_empty() {
            "empty".to_string()
        } else {
            parts.join(" ")
        }
    }
}

impl Ord for Category {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as usize).cmp(&(*other as usize))
    }
}

impl PartialOrd for Category {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub left: DiffSide,
    pub right: DiffSide,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Care about where files sit, not just that the content exists: detect
    /// moves, duplicates, and in-place updates.
    pub compare_paths_also: bool,
    /// Use modify_ts to guess the direction of a rename (newer side is the
    /// destination). Off by default: with a symmetric diff both sides are
    /// marked and the caller arbitrates.
    pub use_modify_times: bool,
    /// Include trashed nodes in matching.
    pub include_trashed: bool,
}

/// Platform metadata files excluded from diffing.
const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "._*",
    "*.crdownload",
    "*.partial",
];

/// Glob-based ignore predicate applied to file names.
pub struct IgnoreRules {
    set: GlobSet,
}

impl IgnoreRules {
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern.as_ref())?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.set.is_match(name)
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        // The defaults are valid globs; a failure here is a programmer error
        // caught by the unit tests, not a runtime condition.
        Self::from_patterns(DEFAULT_IGNORE_PATTERNS.iter().copied())
            .unwrap_or_else(|_| Self {
                set: GlobSet::empty(),
            })
    }
}

/// Immutable view of one tree's files for diffing.
pub struct TreeSnapshot {
    root_path: String,
    by_md5: BTreeMap<String, Vec<FileNode>>,
    by_path: HashMap<String, FileNode>,
    ignored: Vec<FileNode>,
    hashless: Vec<FileNode>,
}

impl TreeSnapshot {
    pub fn from_index(
        index: &MemoryIndex,
        root_path: &str,
        ignore: &IgnoreRules,
        include_trashed: bool,
    ) -> Self {
        let root_path = normalize_path(root_path);
        let mut by_md5: BTreeMap<String, Vec<FileNode>> = BTreeMap::new();
        let mut by_path = HashMap::new();
        let mut ignored = Vec::new();
        let mut hashless = Vec::new();

        for file in index.files_under(&root_path, include_trashed) {
            if ignore.matches(file.identifier.name()) {
                ignored.push(file);
                continue;
            }
            let Some(md5) = file.md5.clone() else {
                hashless.push(file);
                continue;
            };
            for path in file.identifier.path_list.clone() {
                let mut at_path = file.clone();
                at_path.identifier.path_list = vec![path.clone()];
                by_path.insert(path, at_path.clone());
                by_md5.entry(md5.clone()).or_default().push(at_path);
            }
        }

        for nodes in by_md5.values_mut() {
            nodes.sort_by(|a, b| a.identifier.single_path().cmp(b.identifier.single_path()));
        }

        Self {
            root_path,
            by_md5,
            by_path,
            ignored,
            hashless,
        }
    }

    fn relative(&self, path: &str) -> String {
        if self.root_path == "/" {
            path.to_string()
        } else {
            path.strip_prefix(&self.root_path)
                .unwrap_or(path)
                .to_string()
        }
    }

    fn absolute(&self, rel: &str) -> String {
        if self.root_path == "/" {
            rel.to_string()
        } else {
            format!("{}{rel}", self.root_path)
        }
    }

    /// The path this tree would use for a node of the other tree.
    fn remap_from(&self, other: &TreeSnapshot, path: &str) -> String {
        self.absolute(&other.relative(path))
    }
}

pub struct DiffEngine {
    options: DiffOptions,
}

impl DiffEngine {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    pub fn diff(&self, left: &TreeSnapshot, right: &TreeSnapshot) -> DiffResult {
        debug!(
            "Computing content-first diff: left='{}' right='{}'",
            left.root_path, right.root_path
        );

        let mut left_entries: Vec<DiffEntry> = Vec::new();
        let mut right_entries: Vec<DiffEntry> = Vec::new();

        for file in &left.ignored {
            left_entries.push(DiffEntry::real(file.clone(), Category::Ignored));
        }
        for file in &right.ignored {
            right_entries.push(DiffEntry::real(file.clone(), Category::Ignored));
        }
        for file in &left.hashless {
            warn!(
                "No signature for '{}'; excluded from diff",
                file.identifier.single_path()
            );
            left_entries.push(DiffEntry::real(file.clone(), Category::Na));
        }
        for file in &right.hashless {
            warn!(
                "No signature for '{}'; excluded from diff",
                file.identifier.single_path()
            );
            right_entries.push(DiffEntry::real(file.clone(), Category::Na));
        }

        let signatures: BTreeSet<&String> =
            left.by_md5.keys().chain(right.by_md5.keys()).collect();

        for signature in signatures {
            let lefts = left.by_md5.get(signature);
            let rights = right.by_md5.get(signature);

            match (lefts, rights) {
                (None, Some(rights)) => {
                    for node in rights {
                        right_entries.push(DiffEntry::real(node.clone(), Category::Added));
                        left_entries.push(self.ghost_for(left, right, node));
                    }
                }
                (Some(lefts), None) => {
                    for node in lefts {
                        left_entries.push(DiffEntry::real(node.clone(), Category::Added));
                        right_entries.push(self.ghost_for(right, left, node));
                    }
                }
                (Some(lefts), Some(rights)) if self.options.compare_paths_also => {
                    self.pair_same_signature(
                        left,
                        right,
                        lefts,
                        rights,
                        &mut left_entries,
                        &mut right_entries,
                    );
                }
                (Some(lefts), Some(rights)) => {
                    // Content exists somewhere on both sides and the caller
                    // does not care where.
                    for node in lefts {
                        left_entries.push(DiffEntry::real(node.clone(), Category::Unchanged));
                    }
                    for node in rights {
                        right_entries.push(DiffEntry::real(node.clone(), Category::Unchanged));
                    }
                }
                (None, None) => unreachable!("signature came from one of the maps"),
            }
        }

        // A real ADDED and a ghost DELETED meeting at one path is an
        // in-place content change: collapse both to UPDATED.
        mark_in_place_updates(&mut left_entries);
        mark_in_place_updates(&mut right_entries);

        let result = DiffResult {
            left: DiffSide {
                root_path: left.root_path.clone(),
                entries: left_entries,
            },
            right: DiffSide {
                root_path: right.root_path.clone(),
                entries: right_entries,
            },
        };

        info!(
            "Done with diff. Left:[{}] Right:[{}]",
            result.left.summary_string(),
            result.right.summary_string()
        );
        validate_categories(&result);
        result
    }

    /// Pair up same-signature nodes across the two sides. Pairs whose
    /// remapped paths match are unchanged; mismatched pairs are renames;
    /// leftovers are duplicates, attributed ADDED on the side that has the
    /// extra copy and ghost DELETED on the other.
    #[allow(clippy::too_many_arguments)]
    fn pair_same_signature(
        &self,
        left: &TreeSnapshot,
        right: &TreeSnapshot,
        lefts: &[FileNode],
        rights: &[FileNode],
        left_entries: &mut Vec<DiffEntry>,
        right_entries: &mut Vec<DiffEntry>,
    ) {
        // Path-equivalent pairs first, then positional pairing of the rest.
        let mut rights_unmatched: Vec<&FileNode> = Vec::new();
        let mut matched_left_paths: BTreeSet<String> = BTreeSet::new();

        for right_node in rights {
            let remapped = left.remap_from(right, right_node.identifier.single_path());
            let matches = lefts
                .iter()
                .any(|l| l.identifier.single_path() == remapped);
            if matches {
                matched_left_paths.insert(remapped);
                right_entries.push(DiffEntry::real(right_node.clone(), Category::Unchanged));
            } else {
                rights_unmatched.push(right_node);
            }
        }

        let mut lefts_unmatched: Vec<&FileNode> = Vec::new();
        for left_node in lefts {
            if matched_left_paths.contains(left_node.identifier.single_path()) {
                left_entries.push(DiffEntry::real(left_node.clone(), Category::Unchanged));
            } else {
                lefts_unmatched.push(left_node);
            }
        }

        let pair_count = lefts_unmatched.len().min(rights_unmatched.len());
        for i in 0..pair_count {
            let left_node = lefts_unmatched[i];
            let right_node = rights_unmatched[i];

            // The direction of a rename is a best guess; the user makes the
            // final call. Either the newer side is assumed the destination,
            // or both sides claim it symmetrically.
            if self.options.use_modify_times {
                if left_node.modify_ts > right_node.modify_ts {
                    let mut entry = DiffEntry::real(left_node.clone(), Category::Moved);
                    entry.prev_path = Some(right_node.identifier.single_path().to_string());
                    left_entries.push(entry);
                    right_entries.push(DiffEntry::real(right_node.clone(), Category::Unchanged));
                } else {
                    let mut entry = DiffEntry::real(right_node.clone(), Category::Moved);
                    entry.prev_path = Some(left_node.identifier.single_path().to_string());
                    right_entries.push(entry);
                    left_entries.push(DiffEntry::real(left_node.clone(), Category::Unchanged));
                }
            } else {
                let mut left_entry = DiffEntry::real(left_node.clone(), Category::Moved);
                left_entry.prev_path = Some(right_node.identifier.single_path().to_string());
                left_entries.push(left_entry);

                let mut right_entry = DiffEntry::real(right_node.clone(), Category::Moved);
                right_entry.prev_path = Some(left_node.identifier.single_path().to_string());
                right_entries.push(right_entry);
            }
        }

        // Extra copies on one side: duplicates.
        for left_node in &lefts_unmatched[pair_count..] {
            left_entries.push(DiffEntry::real((*left_node).clone(), Category::Added));
            right_entries.push(self.ghost_for(right, left, left_node));
        }
        for right_node in &rights_unmatched[pair_count..] {
            right_entries.push(DiffEntry::real((*right_node).clone(), Category::Added));
            left_entries.push(self.ghost_for(left, right, right_node));
        }
    }

    /// A logical deletion on `this` side, mirroring a node that only exists
    /// on `other`: a copy of the node remapped to this side's corresponding
    /// path.
    fn ghost_for(&self, this: &TreeSnapshot, other: &TreeSnapshot, node: &FileNode) -> DiffEntry {
        let mut copy = node.clone();
        let remapped = this.remap_from(other, node.identifier.single_path());
        copy.identifier.path_list = vec![remapped];
        DiffEntry::ghost(copy, Category::Deleted)
    }
}

/// Deepest directory that is an ancestor of both paths. Used to root a
/// merged presentation of two diffed trees.
pub fn nearest_common_ancestor(path1: &str, path2: &str) -> String {
    let segs1: Vec<&str> = path1.split('/').filter(|s| !s.is_empty()).collect();
    let segs2: Vec<&str> = path2.split('/').filter(|s| !s.is_empty()).collect();

    let mut ancestor = String::new();
    for (a, b) in segs1.iter().zip(segs2.iter()) {
        if a != b {
            break;
        }
        ancestor.push('/');
        ancestor.push_str(a);
    }
    if ancestor.is_empty() {
        "/".to_string()
    } else {
        ancestor
    }
}

/// Collapse (real ADDED, ghost DELETED) pairs at one path into UPDATED.
fn mark_in_place_updates(entries: &mut [DiffEntry]) {
    let mut added_at: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.category == Category::Added && !entry.ghost {
            added_at
                .entry(entry.node.identifier.single_path().to_string())
                .or_default()
                .push(idx);
        }
    }

    let mut to_update: Vec<usize> = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.category == Category::Deleted && entry.ghost {
            if let Some(added) = added_at.get(entry.node.identifier.single_path()) {
                to_update.push(idx);
                to_update.extend(added.iter().copied());
            }
        }
    }

    for idx in to_update {
        entries[idx].category = Category::Updated;
    }
}

/// Per-side category sanity logging after a diff.
fn validate_categories(result: &DiffResult) {
    for (side_name, side) in [("Left", &result.left), ("Right", &result.right)] {
        let counts = side.category_counts();
        debug!("Validating categories on {side_name}: {counts:?}");
        for entry in &side.entries {
            if entry.category == Category::Moved && entry.prev_path.is_none() {
                warn!(
                    "{side_name}: MOVED entry without prev_path: '{}'",
                    entry.node.identifier.single_path()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceUid, TreeType, Uid};
    use crate::node::{NodeIdentifier, Node, TrashStatus};

    fn index_with(files: &[(i64, &str, &str, i64)]) -> MemoryIndex {
        // (uid, path, md5, modify_ts)
        let index = MemoryIndex::new(DeviceUid(1), TreeType::LocalDisk, true, false);
        for (uid, path, md5, modify_ts) in files {
            index
                .upsert_node(
                    Node::File(FileNode {
                        identifier: NodeIdentifier::new(DeviceUid(1), Uid(*uid), *path),
                        parent_uids: vec![Uid(1)],
                        size_bytes: 5,
                        md5: Some(md5.to_string()),
                        sha256: None,
                        sync_ts: 0,
                        modify_ts: *modify_ts,
                        change_ts: 0,
                        trashed: TrashStatus::NotTrashed,
                        live: true,
                        external_id: None,
                        version: None,
                    }),
                    false,
                )
                .unwrap();
        }
        index
    }

    fn snapshot(index: &MemoryIndex, root: &str) -> TreeSnapshot {
        TreeSnapshot::from_index(index, root, &IgnoreRules::default(), false)
    }

    fn entries_with(side: &DiffSide, category: Category) -> Vec<&DiffEntry> {
        side.entries.iter().filter(|e| e.category == category).collect()
    }

    #[test]
    fn move_is_detected_with_prev_path() {
        let left = index_with(&[(2, "/a/foo.txt", "X", 10)]);
        let right = index_with(&[(2, "/b/foo.txt", "X", 10)]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/b"));

        let left_moved = entries_with(&result.left, Category::Moved);
        let right_moved = entries_with(&result.right, Category::Moved);
        assert_eq!(left_moved.len(), 1);
        assert_eq!(right_moved.len(), 1);
        assert_eq!(left_moved[0].prev_path.as_deref(), Some("/b/foo.txt"));
        assert_eq!(right_moved[0].prev_path.as_deref(), Some("/a/foo.txt"));
    }

    #[test]
    fn same_path_different_content_is_updated_on_both_sides() {
        let left = index_with(&[(2, "/a/x.txt", "X", 10)]);
        let right = index_with(&[(2, "/a/x.txt", "Y", 20)]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        assert_eq!(entries_with(&result.left, Category::Updated).len(), 2);
        assert_eq!(entries_with(&result.right, Category::Updated).len(), 2);
        assert!(entries_with(&result.left, Category::Added).is_empty());
        assert!(entries_with(&result.right, Category::Added).is_empty());
    }

    #[test]
    fn one_sided_file_is_added_with_ghost_deleted() {
        let left = index_with(&[(2, "/a/new.txt", "Z", 10)]);
        let right = index_with(&[]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        let added = entries_with(&result.left, Category::Added);
        assert_eq!(added.len(), 1);
        assert!(!added[0].ghost);

        let ghost = entries_with(&result.right, Category::Deleted);
        assert_eq!(ghost.len(), 1);
        assert!(ghost[0].ghost);
        assert_eq!(ghost[0].node.identifier.single_path(), "/a/new.txt");
    }

    #[test]
    fn ghost_path_is_remapped_across_roots() {
        let left = index_with(&[(2, "/left/sub/f.txt", "Z", 10)]);
        let right = index_with(&[]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/left"), &snapshot(&right, "/right"));

        let ghost = entries_with(&result.right, Category::Deleted);
        assert_eq!(ghost[0].node.identifier.single_path(), "/right/sub/f.txt");
    }

    #[test]
    fn duplicate_copy_is_attributed_added_and_ghost_deleted() {
        let left = index_with(&[(2, "/a/f.txt", "X", 10), (3, "/a/copy.txt", "X", 10)]);
        let right = index_with(&[(2, "/a/f.txt", "X", 10)]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        let added = entries_with(&result.left, Category::Added);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].node.identifier.single_path(), "/a/copy.txt");
        assert_eq!(entries_with(&result.right, Category::Deleted).len(), 1);
        assert_eq!(entries_with(&result.left, Category::Unchanged).len(), 1);
    }

    #[test]
    fn modify_times_pick_the_rename_destination() {
        let left = index_with(&[(2, "/a/new_name.txt", "X", 100)]);
        let right = index_with(&[(2, "/a/old_name.txt", "X", 50)]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            use_modify_times: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        // Left is newer: it is the destination of the rename.
        assert_eq!(entries_with(&result.left, Category::Moved).len(), 1);
        assert!(entries_with(&result.right, Category::Moved).is_empty());
    }

    #[test]
    fn content_only_mode_marks_everything_unchanged() {
        let left = index_with(&[(2, "/a/here.txt", "X", 10)]);
        let right = index_with(&[(2, "/a/elsewhere.txt", "X", 10)]);
        let engine = DiffEngine::new(DiffOptions::default());
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        assert_eq!(entries_with(&result.left, Category::Unchanged).len(), 1);
        assert_eq!(entries_with(&result.right, Category::Unchanged).len(), 1);
    }

    #[test]
    fn ignored_names_are_excluded_from_matching() {
        let left = index_with(&[(2, "/a/.DS_Store", "X", 10)]);
        let right = index_with(&[]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        assert_eq!(entries_with(&result.left, Category::Ignored).len(), 1);
        assert!(entries_with(&result.right, Category::Deleted).is_empty());
    }

    #[test]
    fn nearest_common_ancestor_walks_up() {
        assert_eq!(nearest_common_ancestor("/a/b/c", "/a/b/d"), "/a/b");
        assert_eq!(nearest_common_ancestor("/a/b", "/a/b/c"), "/a/b");
        assert_eq!(nearest_common_ancestor("/x", "/y"), "/");
    }

    #[test]
    fn hash_counts_balance_across_sides() {
        // For every hash: |{left, cat != DELETED}| == |{right, cat != ADDED}|
        let left = index_with(&[
            (2, "/a/x.txt", "X", 10),
            (3, "/a/y.txt", "Y", 10),
            (4, "/a/z.txt", "Z", 10),
        ]);
        let right = index_with(&[
            (2, "/a/x.txt", "X", 10),
            (3, "/a/moved/y.txt", "Y", 10),
            (4, "/a/z.txt", "W", 20),
        ]);
        let engine = DiffEngine::new(DiffOptions {
            compare_paths_also: true,
            ..Default::default()
        });
        let result = engine.diff(&snapshot(&left, "/a"), &snapshot(&right, "/a"));

        let mut hashes = BTreeSet::new();
        for entry in result.left.entries.iter().chain(&result.right.entries) {
            if let Some(md5) = &entry.node.md5 {
                hashes.insert(md5.clone());
            }
        }
        for hash in hashes {
            let left_count = result
                .left
                .entries
                .iter()
                .filter(|e| e.node.md5.as_deref() == Some(hash.as_str()))
                .filter(|e| e.category != Category::Deleted)
                .count();
            let right_count = result
                .right
                .entries
                .iter()
                .filter(|e| e.node.md5.as_deref() == Some(hash.as_str()))
                .filter(|e| e.category != Category::Added)
                .count();
            assert_eq!(left_count, right_count, "imbalance for hash {hash}");
        }
    }
}
