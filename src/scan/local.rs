//! Local disk scanner
//!
//! Two passes over the subtree: a count pass for progress totals, then a
//! build pass driven by a FIFO directory queue. The crawl runs in the task
//! runner's bulk lane: each task processes directories until roughly
//! `batch_size` entries have been handled, then finishes by re-submitting a
//! continuation task carrying the remaining queue, so user-visible and
//! live-update work always schedules ahead of a deep crawl.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::node::identifier::normalize_path;
use crate::node::Node;
use crate::scan::hasher::{ContentHasher, HashFlavors};
use crate::store::LocalTreeStore;
use crate::tasks::{ExecPriority, Task, TaskRunner};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub files: u64,
    pub dirs: u64,
    pub skipped: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Count,
    Build,
    Reconcile,
}

/// Work-in-progress state carried between continuation tasks.
struct ScanState {
    root_path: String,
    phase: ScanPhase,
    count_queue: VecDeque<PathBuf>,
    total: u64,
    build_queue: VecDeque<PathBuf>,
    stats: ScanStats,
    processed: u64,
    scan_start_ts: i64,
}

enum StepOutcome {
    Continue(ScanState),
    Finished(ScanStats),
}

pub struct LocalScanner {
    store: Arc<LocalTreeStore>,
    events: Arc<EventBus>,
    runner: Arc<TaskRunner>,
    hasher: ContentHasher,
    batch_size: usize,
}

impl LocalScanner {
    pub fn new(
        store: Arc<LocalTreeStore>,
        events: Arc<EventBus>,
        runner: Arc<TaskRunner>,
        config: &EngineConfig,
    ) -> Self {
        let hasher = ContentHasher::new(
            config.read_chunk_size,
            config.max_link_depth,
            HashFlavors {
                md5: config.enable_md5_lookup,
                sha256: config.enable_sha256,
            },
        );
        Self {
            store,
            events,
            runner,
            hasher,
            batch_size: config.scan_batch_size.max(1),
        }
    }

    /// Scan the subtree rooted at `root_path`, reconciling the index with
    /// the live tree. The work itself runs as a chain of bulk-lane tasks;
    /// this future resolves when the chain finishes.
    pub async fn scan(self: Arc<Self>, root_path: &str) -> EngineResult<ScanStats> {
        let root_path = normalize_path(root_path);
        info!("Scanning local subtree '{root_path}'");

        let state = ScanState {
            root_path: root_path.clone(),
            phase: ScanPhase::Count,
            count_queue: VecDeque::from([PathBuf::from(&root_path)]),
            total: 0,
            build_queue: VecDeque::from([PathBuf::from(&root_path)]),
            stats: ScanStats::default(),
            processed: 0,
            scan_start_ts: crate::node::now_ts(),
        };

        let (done_tx, done_rx) = oneshot::channel();
        Self::submit_step(self, state, done_tx);
        done_rx.await.map_err(|_| EngineError::Interrupted)?
    }

    /// Submit one crawl step to the bulk lane. The step re-submits itself
    /// with the remaining queue until every phase has run.
    fn submit_step(
        scanner: Arc<Self>,
        state: ScanState,
        done_tx: oneshot::Sender<EngineResult<ScanStats>>,
    ) {
        let runner = scanner.runner.clone();
        let name = format!("scan {}", state.root_path);
        runner.submit(Task::new(ExecPriority::P4DiskCrawl, name, async move {
            match scanner.step(state).await {
                Ok(StepOutcome::Continue(state)) => Self::submit_step(scanner, state, done_tx),
                Ok(StepOutcome::Finished(stats)) => {
                    let _ = done_tx.send(Ok(stats));
                }
                Err(err) => {
                    let _ = done_tx.send(Err(err));
                }
            }
        }));
    }

    async fn step(&self, mut state: ScanState) -> EngineResult<StepOutcome> {
        match state.phase {
            ScanPhase::Count => {
                self.count_step(&mut state).await?;
                Ok(StepOutcome::Continue(state))
            }
            ScanPhase::Build => {
                self.build_step(&mut state).await?;
                Ok(StepOutcome::Continue(state))
            }
            ScanPhase::Reconcile => {
                self.reconcile_deletions(&state.root_path, state.scan_start_ts)
                    .await?;
                info!(
                    "Scan of '{}' complete: {} files, {} dirs, {} bytes",
                    state.root_path, state.stats.files, state.stats.dirs, state.stats.bytes
                );
                self.events.emit(Event::TreeLoaded {
                    device_uid: self.store.device.uid,
                    node_count: (state.stats.files + state.stats.dirs) as usize,
                });
                Ok(StepOutcome::Finished(state.stats))
            }
        }
    }

    /// First pass: enumerate entries so progress can report a total. Stops
    /// between directories once enough entries were counted for one step.
    async fn count_step(&self, state: &mut ScanState) -> EngineResult<()> {
        let mut counted_this_step: u64 = 0;

        while let Some(dir_path) = state.count_queue.pop_front() {
            let mut read_dir = match tokio::fs::read_dir(&dir_path).await {
                Ok(rd) => rd,
                Err(err) => {
                    warn!("Count pass cannot read '{}': {err}", dir_path.display());
                    continue;
                }
            };
            while let Some(entry) = read_dir.next_entry().await? {
                state.total += 1;
                counted_this_step += 1;
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(_) => continue,
                };
                // Do not follow symlinks into their targets.
                if file_type.is_dir() {
                    state.count_queue.push_back(entry.path());
                }
            }
            if counted_this_step >= self.batch_size as u64 {
                return Ok(());
            }
        }

        debug!(
            "Count pass found {} entries under '{}'",
            state.total, state.root_path
        );

        // Root dir node first so children have a parent to hang off.
        let root_node = self.store.build_dir_node(&state.root_path, true);
        self.store.upsert_node(root_node).await?;
        state.stats.dirs += 1;
        state.phase = ScanPhase::Build;
        Ok(())
    }

    /// Build pass: index directories from the FIFO queue, one batched
    /// writeback per directory, until this step has handled enough entries.
    async fn build_step(&self, state: &mut ScanState) -> EngineResult<()> {
        let mut processed_this_step: u64 = 0;

        while let Some(dir_path) = state.build_queue.pop_front() {
            let entry_count = self.index_directory(&dir_path, state).await?;
            processed_this_step += entry_count;

            self.events.emit(Event::Progress {
                label: format!("scan {}", state.root_path),
                done: state.processed,
                total: state.total,
            });

            if processed_this_step >= self.batch_size as u64 {
                return Ok(());
            }
        }

        state.phase = ScanPhase::Reconcile;
        Ok(())
    }

    async fn index_directory(&self, dir_path: &Path, state: &mut ScanState) -> EngineResult<u64> {
        let mut batch: Vec<Node> = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(dir_path).await {
            Ok(rd) => rd,
            Err(err) => {
                warn!("Cannot read '{}': {err}", dir_path.display());
                state.stats.skipped += 1;
                return Ok(0);
            }
        };

        let mut entry_count: u64 = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            entry_count += 1;
            let path = entry.path();
            let path_str = path.to_string_lossy().to_string();
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(_) => {
                    state.stats.skipped += 1;
                    continue;
                }
            };

            if file_type.is_dir() {
                state.build_queue.push_back(path.clone());
                batch.push(self.store.build_dir_node(&path_str, true));
                state.stats.dirs += 1;
            } else {
                match self.build_file(&path_str).await {
                    Ok(Some(node)) => {
                        state.stats.bytes += node.size_bytes();
                        state.stats.files += 1;
                        batch.push(node);
                    }
                    Ok(None) => state.stats.skipped += 1,
                    Err(err) => {
                        warn!("Skipping '{path_str}': {err}");
                        state.stats.skipped += 1;
                    }
                }
            }
            state.processed += 1;
        }

        if !batch.is_empty() {
            self.store.upsert_node_list(batch).await?;
        }
        debug!("Indexed {entry_count} entries in '{}'", dir_path.display());
        Ok(entry_count)
    }

    async fn build_file(&self, path_str: &str) -> EngineResult<Option<Node>> {
        // Reuse the cached hash when metadata is unchanged: build the node
        // hashless first and let the memory merge copy the hash over; only
        // when no cached copy matches do we pay for a hash computation.
        let fresh = self.store.build_file_node(path_str, None).await?;
        let needs_hash = match self.store.node_for_path(path_str) {
            Some(Node::File(cached)) => {
                let Node::File(fresh_file) = &fresh else { return Ok(None) };
                !(cached.meta_matches(fresh_file) && cached.md5.is_some())
            }
            Some(Node::Dir(_)) => true,
            None => true,
        };

        if !needs_hash {
            return Ok(Some(fresh));
        }

        let hashed = self
            .store
            .build_file_node(path_str, Some(&self.hasher))
            .await?;
        if hashed.md5().is_none() {
            debug!("Indexed without hash (unreadable): '{path_str}'");
        }
        Ok(Some(hashed))
    }

    /// Remove index entries whose paths were not observed by this scan.
    async fn reconcile_deletions(&self, root_path: &str, scan_start_ts: i64) -> EngineResult<()> {
        let stale: Vec<Node> = self
            .store
            .memory
            .files_under(root_path, true)
            .into_iter()
            .filter(|f| f.sync_ts < scan_start_ts)
            .map(Node::File)
            .collect();

        for node in stale {
            let path = node.single_path().to_string();
            if tokio::fs::symlink_metadata(Path::new(&path)).await.is_err() {
                debug!("Live tree no longer has '{path}'; removing from index");
                self.store.remove_node(node.uid()).await?;
            }
        }

        // Vanished directories, deepest first so children go before parents.
        for uid in self.store.memory.uids_under(root_path) {
            let Some(node) = self.store.memory.get_node(uid) else { continue };
            if !node.is_dir() {
                continue;
            }
            let path = node.single_path().to_string();
            if tokio::fs::symlink_metadata(Path::new(&path)).await.is_err() {
                debug!("Live tree no longer has dir '{path}'; removing from index");
                self.store.remove_node(uid).await?;
            }
        }
        Ok(())
    }
}
