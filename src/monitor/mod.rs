//! Live monitor
//!
//! Watches live trees for external changes and feeds them back into the
//! indices. Local filesystem events are messy and arrive in bursts, so they
//! are coalesced into a path-keyed batch and applied after a quiet period.
//! Moves the executor performs itself are pre-registered so the resulting
//! notifications are recognized and dropped instead of double-applied.
//! Cloud changes arrive through the provider's change-token stream, polled
//! on an interval.

use crate::error::EngineResult;
use crate::events::{Event as EngineEvent, EventBus};
use crate::node::identifier::normalize_path;
use crate::scan::hasher::{ContentHasher, HashFlavors};
use crate::scan::CloudTreeLoader;
use crate::store::LocalTreeStore;
use crate::tasks::{ExecPriority, Task, TaskRunner};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Moves initiated by the executor, registered before the filesystem event
/// arrives so it can be ignored. Keyed old path → new path.
#[derive(Default)]
pub struct ExpectedMoves {
    map: Mutex<HashMap<String, String>>,
}

impl ExpectedMoves {
    pub fn register(&self, src_path: &str, dst_path: &str) {
        self.map
            .lock()
            .unwrap()
            .insert(src_path.to_string(), dst_path.to_string());
    }

    /// Consume the expectation for `src_path`, if any.
    pub fn take(&self, src_path: &str) -> Option<String> {
        self.map.lock().unwrap().remove(src_path)
    }
}

/// One change observed on a live tree, pre-coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PathOp {
    Created(PathBuf),
    Removed(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
}

#[derive(Default)]
struct PendingChanges {
    modified: HashSet<PathBuf>,
    other_ops: Vec<PathOp>,
}

struct WatchEntry {
    _watcher: RecommendedWatcher,
    refcount: usize,
}

pub struct LiveMonitor {
    batch_interval: Duration,
    poll_interval: Duration,
    hasher: Arc<ContentHasher>,
    runner: Arc<TaskRunner>,
    events: Arc<EventBus>,
    expected_moves: Arc<ExpectedMoves>,
    pending: Arc<Mutex<PendingChanges>>,
    pending_notify: Arc<Notify>,
    watchers: Mutex<HashMap<String, WatchEntry>>,
    /// Store that handles events under each watched root
    routes: Arc<Mutex<Vec<(String, Arc<LocalTreeStore>)>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl LiveMonitor {
    pub fn new(
        config: &crate::config::EngineConfig,
        runner: Arc<TaskRunner>,
        events: Arc<EventBus>,
        expected_moves: Arc<ExpectedMoves>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let monitor = Arc::new(Self {
            batch_interval: Duration::from_millis(config.change_batch_interval_ms),
            poll_interval: Duration::from_millis(config.cloud_poll_interval_ms),
            hasher: Arc::new(ContentHasher::new(
                config.read_chunk_size,
                config.max_link_depth,
                HashFlavors {
                    md5: config.enable_md5_lookup,
                    sha256: config.enable_sha256,
                },
            )),
            runner,
            events,
            expected_moves,
            pending: Arc::new(Mutex::new(PendingChanges::default())),
            pending_notify: Arc::new(Notify::new()),
            watchers: Mutex::new(HashMap::new()),
            routes: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
        });
        monitor.clone().spawn_batching_loop();
        monitor
    }

    /// Start watching a local subtree. Watchers are shared per root path and
    /// reference-counted across views rooted at the same path.
    pub fn watch_local(&self, store: Arc<LocalTreeStore>, root_path: &str) -> EngineResult<()> {
        let root_path = normalize_path(root_path);
        let mut watchers = self.watchers.lock().unwrap();

        if let Some(entry) = watchers.get_mut(&root_path) {
            entry.refcount += 1;
            debug!(
                "Sharing existing watcher for '{root_path}' (refcount {})",
                entry.refcount
            );
            return Ok(());
        }

        let pending = self.pending.clone();
        let pending_notify = self.pending_notify.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let mut guard = pending.lock().unwrap();
                    enqueue_event(&mut guard, event);
                    drop(guard);
                    pending_notify.notify_one();
                }
                Err(err) => warn!("Filesystem watch error: {err}"),
            }
        })
        .map_err(|err| crate::error::EngineError::Io(std::io::Error::other(err)))?;

        watcher
            .watch(Path::new(&root_path), RecursiveMode::Recursive)
            .map_err(|err| crate::error::EngineError::Io(std::io::Error::other(err)))?;

        info!("Watching local subtree '{root_path}'");
        watchers.insert(
            root_path.clone(),
            WatchEntry {
                _watcher: watcher,
                refcount: 1,
            },
        );
        self.routes.lock().unwrap().push((root_path, store));
        Ok(())
    }

    /// Drop one reference to the watcher for `root_path`; the watcher itself
    /// goes away when the last reference does.
    pub fn unwatch_local(&self, root_path: &str) {
        let root_path = normalize_path(root_path);
        let mut watchers = self.watchers.lock().unwrap();
        if let Some(entry) = watchers.get_mut(&root_path) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                watchers.remove(&root_path);
                self.routes.lock().unwrap().retain(|(root, _)| *root != root_path);
                info!("Stopped watching '{root_path}'");
            }
        }
    }

    /// Start the cloud change-token poll loop.
    pub fn start_cloud_poll(&self, loader: Arc<CloudTreeLoader>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.poll_interval;
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                match loader.apply_changes().await {
                    Ok(applied) if applied > 0 => {
                        debug!("Cloud poll applied {applied} changes");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("Cloud change poll failed: {err}");
                        events.emit(EngineEvent::ErrorOccurred {
                            context: "cloud change poll".to_string(),
                            message: err.to_string(),
                        });
                    }
                }
            }
            debug!("Cloud poll loop exited");
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.pending_notify.notify_waiters();
    }

    /// Batching loop: wait for the first event, let the quiet period pass,
    /// then hand the whole coalesced batch to the task runner in the
    /// live-update lane.
    fn spawn_batching_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let has_pending = {
                    let pending = self.pending.lock().unwrap();
                    !pending.modified.is_empty() || !pending.other_ops.is_empty()
                };
                if !has_pending {
                    tokio::select! {
                        _ = self.pending_notify.notified() => {}
                        _ = shutdown_rx.changed() => continue,
                    }
                }

                // Quiet period: let the burst finish before applying.
                tokio::time::sleep(self.batch_interval).await;

                let (modified, other_ops) = {
                    let mut pending = self.pending.lock().unwrap();
                    (
                        std::mem::take(&mut pending.modified),
                        std::mem::take(&mut pending.other_ops),
                    )
                };
                if modified.is_empty() && other_ops.is_empty() {
                    continue;
                }

                let this = self.clone();
                self.runner.submit(Task::new(
                    ExecPriority::P3LiveUpdate,
                    "apply fs update batch",
                    async move {
                        this.apply_batch(modified, other_ops).await;
                    },
                ));
            }
            debug!("Change batching loop exited");
        });
    }

    async fn apply_batch(&self, modified: HashSet<PathBuf>, other_ops: Vec<PathOp>) {
        debug!(
            "Applying live update batch: {} modifications, {} ops",
            modified.len(),
            other_ops.len()
        );

        for op in other_ops {
            if let Err(err) = self.apply_path_op(&op).await {
                warn!("Could not apply {op:?}: {err}");
            }
        }

        for path in modified {
            let path_str = path.to_string_lossy().to_string();
            let Some(store) = self.route_for(&path_str) else { continue };
            match store.build_file_node(&path_str, Some(&self.hasher)).await {
                Ok(node) => {
                    if let Err(err) = store.upsert_node(node).await {
                        warn!("Could not apply modification of '{path_str}': {err}");
                    }
                }
                Err(_) => {
                    debug!("Cannot process external change: file not found: '{path_str}'");
                }
            }
        }
    }

    async fn apply_path_op(&self, op: &PathOp) -> EngineResult<()> {
        match op {
            PathOp::Created(path) => {
                let path_str = path.to_string_lossy().to_string();
                let Some(store) = self.route_for(&path_str) else {
                    return Ok(());
                };
                let node = if path.is_dir() {
                    store.build_dir_node(&path_str, true)
                } else {
                    store.build_file_node(&path_str, Some(&self.hasher)).await?
                };
                store.upsert_node(node).await?;
            }
            PathOp::Removed(path) => {
                let path_str = path.to_string_lossy().to_string();
                let Some(store) = self.route_for(&path_str) else {
                    return Ok(());
                };
                match store.node_for_path(&path_str) {
                    Some(node) if node.is_dir() => {
                        store.remove_subtree(&path_str).await?;
                    }
                    Some(node) => {
                        store.remove_node(node.uid()).await?;
                    }
                    None => {
                        debug!("Cannot remove from cache: no node at '{path_str}'");
                    }
                }
            }
            PathOp::Moved { from, to } => {
                let from_str = from.to_string_lossy().to_string();
                let to_str = to.to_string_lossy().to_string();

                if let Some(expected_dst) = self.expected_moves.take(&from_str) {
                    if expected_dst == to_str {
                        debug!("Ignoring MV '{from_str}' -> '{to_str}': already applied");
                        return Ok(());
                    }
                    warn!(
                        "MV '{from_str}' -> '{to_str}': was expecting dst '{expected_dst}'"
                    );
                }

                let Some(store) = self.route_for(&from_str) else {
                    return Ok(());
                };
                store.move_subtree(&from_str, &to_str).await?;
            }
        }
        Ok(())
    }

    fn route_for(&self, path: &str) -> Option<Arc<LocalTreeStore>> {
        let routes = self.routes.lock().unwrap();
        routes
            .iter()
            .filter(|(root, _)| path == root || path.starts_with(&format!("{root}/")))
            .max_by_key(|(root, _)| root.len())
            .map(|(_, store)| store.clone())
    }
}

/// Map a raw notify event into the pending batch.
fn enqueue_event(pending: &mut PendingChanges, event: Event) {
    use notify::event::{ModifyKind, RenameMode};

    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths {
                pending.other_ops.push(PathOp::Created(path));
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                pending.other_ops.push(PathOp::Removed(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() == 2 {
                pending.other_ops.push(PathOp::Moved {
                    from: event.paths[0].clone(),
                    to: event.paths[1].clone(),
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                pending.other_ops.push(PathOp::Removed(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths {
                pending.other_ops.push(PathOp::Created(path));
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths {
                pending.modified.insert(path);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_moves_are_consumed_once() {
        let moves = ExpectedMoves::default();
        moves.register("/a/x", "/b/x");
        assert_eq!(moves.take("/a/x").as_deref(), Some("/b/x"));
        assert_eq!(moves.take("/a/x"), None);
    }

    #[test]
    fn rename_events_become_moves() {
        use notify::event::{EventAttributes, ModifyKind, RenameMode};
        let mut pending = PendingChanges::default();
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/t/a"), PathBuf::from("/t/b")],
            attrs: EventAttributes::new(),
        };
        enqueue_event(&mut pending, event);
        assert_eq!(
            pending.other_ops,
            vec![PathOp::Moved {
                from: PathBuf::from("/t/a"),
                to: PathBuf::from("/t/b"),
            }]
        );
    }

    #[test]
    fn data_modifications_coalesce_by_path() {
        let mut pending = PendingChanges::default();
        for _ in 0..3 {
            let event = Event {
                kind: EventKind::Modify(notify::event::ModifyKind::Data(
                    notify::event::DataChange::Content,
                )),
                paths: vec![PathBuf::from("/t/f")],
                attrs: notify::event::EventAttributes::new(),
            };
            enqueue_event(&mut pending, event);
        }
        assert_eq!(pending.modified.len(), 1);
    }
}
