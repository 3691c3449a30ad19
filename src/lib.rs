//! treesync core
//!
//! A bidirectional file-synchronization and diff engine over two kinds of
//! tree: local POSIX subtrees and a cloud drive namespace. The engine keeps
//! per-tree persistent indices keyed by stable uids and content hashes,
//! reconciles them against live state through scans and live monitoring,
//! computes content-first diffs, and executes batches of reversible
//! mutations through a dependency-ordered op graph.

pub mod cloud;
pub mod config;
pub mod db;
pub mod device;
pub mod diff;
pub mod error;
pub mod events;
pub mod memory;
pub mod monitor;
pub mod node;
pub mod op;
pub mod registry;
pub mod scan;
pub mod store;
pub mod tasks;

use crate::cloud::CloudClient;
use crate::config::EngineConfig;
use crate::db::cloud_store::CloudDiskStore;
use crate::db::local_store::LocalDiskStore;
use crate::db::registry_store::{CacheEntry, RegistryStore};
use crate::device::{DeviceUid, TreeType, Uid};
use crate::diff::{DiffEngine, DiffOptions, DiffResult, IgnoreRules, TreeSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::memory::MemoryIndex;
use crate::monitor::{ExpectedMoves, LiveMonitor};
use crate::node::identifier::{normalize_path, path_join, path_parent};
use crate::node::{DirNode, FileNode, Node, NodeIdentifier, TrashStatus};
use crate::op::commands::CommandContext;
use crate::op::executor::OpExecutor;
use crate::op::graph::OpGraph;
use crate::op::staging::StagingArea;
use crate::op::{Batch, Op, OpType};
use crate::registry::UidRegistry;
use crate::scan::hasher::{ContentHasher, HashFlavors};
use crate::scan::{CloudTreeLoader, LocalScanner};
use crate::store::{CloudTreeStore, LocalTreeStore};
use crate::tasks::TaskRunner;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Traffic-light summary of engine state for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EngineSummary {
    /// Initial tree load still running
    Red,
    /// Work pending (scans queued or ops outstanding)
    Yellow,
    /// Idle
    Green,
}

/// The main context for all core operations.
pub struct Engine {
    pub config: EngineConfig,
    pub events: Arc<EventBus>,
    pub registry: Arc<RegistryStore>,
    runner: Arc<TaskRunner>,
    graph: Arc<OpGraph>,
    monitor: Arc<LiveMonitor>,
    expected_moves: Arc<ExpectedMoves>,
    local_stores: RwLock<HashMap<DeviceUid, Arc<LocalTreeStore>>>,
    cloud_stores: RwLock<HashMap<DeviceUid, Arc<CloudTreeStore>>>,
    cloud_client: RwLock<Option<Arc<dyn CloudClient>>>,
    executor: RwLock<Option<Arc<OpExecutor>>>,
    next_op_uid: AtomicI64,
    initial_load_done: std::sync::atomic::AtomicBool,
}

impl Engine {
    /// Initialize the engine in the given data directory (or the platform
    /// default).
    pub async fn new(data_dir: Option<PathBuf>) -> EngineResult<Arc<Self>> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => config::default_data_dir().map_err(|e| EngineError::config(e))?,
        };
        let config =
            EngineConfig::load_or_create(&data_dir).map_err(|e| EngineError::config(e))?;
        config.ensure_directories().map_err(|e| EngineError::config(e))?;
        info!("Initializing treesync engine at {:?}", config.data_dir);

        let registry = Arc::new(RegistryStore::open(&config.registry_db_path()).await?);
        let events = Arc::new(EventBus::default());
        let runner = TaskRunner::new(4);
        let expected_moves = Arc::new(ExpectedMoves::default());
        let monitor = LiveMonitor::new(&config, runner.clone(), events.clone(), expected_moves.clone());

        Ok(Arc::new(Self {
            config,
            events,
            registry,
            runner,
            graph: Arc::new(OpGraph::new()),
            monitor,
            expected_moves,
            local_stores: RwLock::new(HashMap::new()),
            cloud_stores: RwLock::new(HashMap::new()),
            cloud_client: RwLock::new(None),
            executor: RwLock::new(None),
            next_op_uid: AtomicI64::new(1),
            initial_load_done: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    pub fn task_runner(&self) -> Arc<TaskRunner> {
        self.runner.clone()
    }

    pub fn op_graph(&self) -> Arc<OpGraph> {
        self.graph.clone()
    }

    pub fn live_monitor(&self) -> Arc<LiveMonitor> {
        self.monitor.clone()
    }

    /// Register (or reopen) a local subtree, loading its cached index.
    pub async fn add_local_tree(&self, root_path: &str) -> EngineResult<Arc<LocalTreeStore>> {
        let root_path = normalize_path(root_path);
        let device = self
            .registry
            .get_or_create_device(TreeType::LocalDisk, &root_path)
            .await?;

        if let Some(existing) = self.local_stores.read().await.get(&device.uid) {
            return Ok(existing.clone());
        }

        let cache_path = self
            .config
            .cache_dir()
            .join(format!("local_{}.db", device.uid));
        let disk = Arc::new(LocalDiskStore::open(&cache_path, device.uid).await?);
        let uid_registry = Arc::new(UidRegistry::new(device.uid));
        let memory = Arc::new(MemoryIndex::new(
            device.uid,
            TreeType::LocalDisk,
            self.config.enable_md5_lookup,
            self.config.enable_sha256,
        ));
        let store = Arc::new(LocalTreeStore::new(
            device.clone(),
            uid_registry,
            memory,
            disk,
            self.events.clone(),
        ));
        store.load_from_cache().await?;

        self.registry
            .upsert_cache_entry(&CacheEntry {
                device_uid: device.uid,
                cache_location: cache_path.to_string_lossy().to_string(),
                cache_type: TreeType::LocalDisk,
                subtree_root_path: root_path.clone(),
                sync_ts: node::now_ts(),
                is_complete: false,
            })
            .await?;

        self.local_stores
            .write()
            .await
            .insert(device.uid, store.clone());
        debug!("Registered local tree '{root_path}' as device {}", device.uid);
        Ok(store)
    }

    /// Register (or reopen) a cloud account tree, loading its cached index.
    pub async fn add_cloud_tree(&self, account_label: &str) -> EngineResult<Arc<CloudTreeStore>> {
        let device = self
            .registry
            .get_or_create_device(TreeType::Cloud, account_label)
            .await?;

        if let Some(existing) = self.cloud_stores.read().await.get(&device.uid) {
            return Ok(existing.clone());
        }

        let cache_path = self
            .config
            .cache_dir()
            .join(format!("cloud_{}.db", device.uid));
        let disk = Arc::new(CloudDiskStore::open(&cache_path, device.uid).await?);
        let uid_registry = Arc::new(UidRegistry::new(device.uid));
        let memory = Arc::new(MemoryIndex::new(
            device.uid,
            TreeType::Cloud,
            self.config.enable_md5_lookup,
            self.config.enable_sha256,
        ));
        let store = Arc::new(CloudTreeStore::new(
            device.clone(),
            uid_registry,
            memory,
            disk,
            self.events.clone(),
        ));
        store.load_from_cache().await?;

        self.registry
            .upsert_cache_entry(&CacheEntry {
                device_uid: device.uid,
                cache_location: cache_path.to_string_lossy().to_string(),
                cache_type: TreeType::Cloud,
                subtree_root_path: "/".to_string(),
                sync_ts: node::now_ts(),
                is_complete: false,
            })
            .await?;

        self.cloud_stores
            .write()
            .await
            .insert(device.uid, store.clone());
        debug!(
            "Registered cloud tree '{account_label}' as device {}",
            device.uid
        );
        Ok(store)
    }

    pub async fn set_cloud_client(&self, client: Arc<dyn CloudClient>) {
        *self.cloud_client.write().await = Some(client);
    }

    /// Scan a local subtree, reconciling the index against the live tree.
    /// The crawl runs through the task runner's bulk disk lane.
    pub async fn scan_local(&self, root_path: &str) -> EngineResult<scan::local::ScanStats> {
        let store = self.add_local_tree(root_path).await?;
        let scanner = Arc::new(LocalScanner::new(
            store.clone(),
            self.events.clone(),
            self.runner.clone(),
            &self.config,
        ));
        let stats = scanner.scan(root_path).await?;

        let cache_path = self
            .config
            .cache_dir()
            .join(format!("local_{}.db", store.device.uid));
        self.registry
            .upsert_cache_entry(&CacheEntry {
                device_uid: store.device.uid,
                cache_location: cache_path.to_string_lossy().to_string(),
                cache_type: TreeType::LocalDisk,
                subtree_root_path: normalize_path(root_path),
                sync_ts: node::now_ts(),
                is_complete: true,
            })
            .await?;
        self.initial_load_done
            .store(true, Ordering::SeqCst);
        Ok(stats)
    }

    /// Load (or resume loading) a cloud account tree. The download runs
    /// through the task runner's cloud lane.
    pub async fn load_cloud_tree(
        &self,
        account_label: &str,
        invalidate_cache: bool,
    ) -> EngineResult<usize> {
        let store = self.add_cloud_tree(account_label).await?;
        let client = self
            .cloud_client
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::invariant("No cloud client configured"))?;
        let loader = Arc::new(CloudTreeLoader::new(
            store,
            client,
            self.events.clone(),
            self.runner.clone(),
        ));
        let count = loader.load_all(invalidate_cache).await?;
        self.initial_load_done.store(true, Ordering::SeqCst);
        Ok(count)
    }

    /// Start live monitoring of a local subtree.
    pub async fn watch_local_tree(&self, root_path: &str) -> EngineResult<()> {
        let store = self.add_local_tree(root_path).await?;
        self.monitor.watch_local(store, root_path)
    }

    /// Start polling the cloud change stream for an account.
    pub async fn watch_cloud_tree(&self, account_label: &str) -> EngineResult<()> {
        let store = self.add_cloud_tree(account_label).await?;
        let client = self
            .cloud_client
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::invariant("No cloud client configured"))?;
        let loader = Arc::new(CloudTreeLoader::new(
            store,
            client,
            self.events.clone(),
            self.runner.clone(),
        ));
        self.monitor.start_cloud_poll(loader);
        Ok(())
    }

    /// Diff two tree roots. Each root may belong to any registered tree.
    pub async fn diff_trees(
        &self,
        left_root: &str,
        right_root: &str,
        options: DiffOptions,
    ) -> EngineResult<DiffResult> {
        let (left_index, left_device) = self.index_for_root(left_root).await?;
        let (right_index, right_device) = self.index_for_root(right_root).await?;

        let ignore = IgnoreRules::default();
        let left_snapshot =
            TreeSnapshot::from_index(&left_index, left_root, &ignore, options.include_trashed);
        let right_snapshot =
            TreeSnapshot::from_index(&right_index, right_root, &ignore, options.include_trashed);

        let engine = DiffEngine::new(options);
        let result = engine.diff(&left_snapshot, &right_snapshot);

        self.events.emit(Event::DiffDone {
            left_device,
            right_device,
            left_summary: result.left.summary_string(),
            right_summary: result.right.summary_string(),
        });
        Ok(result)
    }

    /// Start a new empty batch.
    pub fn new_batch(&self) -> Batch {
        Batch::new(self.alloc_op_uid())
    }

    /// Stage an RM of an existing node into the batch.
    pub fn stage_rm(&self, batch: &mut Batch, node: Node) {
        batch
            .ops
            .push(Op::new(self.alloc_op_uid(), batch.batch_uid, OpType::Rm, node));
    }

    /// Stage a MKDIR at a path on a device into the batch.
    pub async fn stage_mkdir(
        &self,
        batch: &mut Batch,
        device_uid: DeviceUid,
        path: &str,
    ) -> EngineResult<()> {
        let node = self.plan_dir_node(device_uid, path).await?;
        batch
            .ops
            .push(Op::new(self.alloc_op_uid(), batch.batch_uid, OpType::Mkdir, node));
        Ok(())
    }

    /// Stage a copy of `src_node` to `dst_path` on `dst_device`. A file
    /// becomes one CP op; a directory becomes the START_DIR_CP /
    /// FINISH_DIR_CP pair bracketing ops for every child.
    pub async fn stage_cp(
        &self,
        batch: &mut Batch,
        src_node: Node,
        dst_device: DeviceUid,
        dst_path: &str,
        overwrite: bool,
    ) -> EngineResult<()> {
        if src_node.is_dir() {
            self.stage_dir_transfer(
                batch,
                src_node,
                dst_device,
                normalize_path(dst_path),
                overwrite,
                false,
                None,
            )
            .await
        } else {
            self.stage_file_transfer(batch, src_node, dst_device, dst_path, overwrite, false, None)
                .await
        }
    }

    /// Stage a move of `src_node` to `dst_path` on `dst_device`. A directory
    /// move composes a directory copy with per-child moves and an RM of the
    /// vacated source directory.
    pub async fn stage_mv(
        &self,
        batch: &mut Batch,
        src_node: Node,
        dst_device: DeviceUid,
        dst_path: &str,
        overwrite: bool,
    ) -> EngineResult<()> {
        if src_node.is_dir() {
            self.stage_dir_transfer(
                batch,
                src_node,
                dst_device,
                normalize_path(dst_path),
                overwrite,
                true,
                None,
            )
            .await
        } else {
            self.stage_file_transfer(batch, src_node, dst_device, dst_path, overwrite, true, None)
                .await
        }
    }

    /// Stage one file copy or move. `parent_uid` carries the planned
    /// destination directory's uid when staged as part of a directory
    /// transfer, so children link to a parent that does not exist yet.
    async fn stage_file_transfer(
        &self,
        batch: &mut Batch,
        src_node: Node,
        dst_device: DeviceUid,
        dst_path: &str,
        overwrite: bool,
        delete_src: bool,
        parent_uid: Option<Uid>,
    ) -> EngineResult<()> {
        let mut dst_node = self
            .plan_file_node(dst_device, dst_path, src_node.as_file())
            .await?;
        if let Some(parent) = parent_uid {
            dst_node.set_parent_uids(vec![parent]);
        }
        let op_type = match (delete_src, overwrite) {
            (false, false) => OpType::Cp,
            (false, true) => OpType::CpOnto,
            (true, false) => OpType::Mv,
            (true, true) => OpType::MvOnto,
        };
        batch.ops.push(Op::with_dst(
            self.alloc_op_uid(),
            batch.batch_uid,
            op_type,
            src_node,
            dst_node,
        ));
        Ok(())
    }

    /// Stage a whole directory transfer: START_DIR_CP creates the
    /// destination ahead of its contents, every indexed child is staged
    /// recursively, FINISH_DIR_CP closes the copy after them, and a move
    /// removes the vacated source directory last.
    fn stage_dir_transfer<'a>(
        &'a self,
        batch: &'a mut Batch,
        src_dir: Node,
        dst_device: DeviceUid,
        dst_path: String,
        overwrite: bool,
        delete_src: bool,
        parent_uid: Option<Uid>,
    ) -> futures::future::BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let mut dst_dir = self.plan_dir_node(dst_device, &dst_path).await?;
            if let Some(parent) = parent_uid {
                dst_dir.set_parent_uids(vec![parent]);
            }
            batch.ops.push(Op::with_dst(
                self.alloc_op_uid(),
                batch.batch_uid,
                OpType::StartDirCp,
                src_dir.clone(),
                dst_dir.clone(),
            ));

            for child in self.children_of_source(&src_dir).await? {
                if !child.is_live() || child.trashed().is_trashed() {
                    continue;
                }
                let child_dst = path_join(&dst_path, child.name());
                if child.is_dir() {
                    self.stage_dir_transfer(
                        batch,
                        child,
                        dst_device,
                        child_dst,
                        overwrite,
                        delete_src,
                        Some(dst_dir.uid()),
                    )
                    .await?;
                } else {
                    self.stage_file_transfer(
                        batch,
                        child,
                        dst_device,
                        &child_dst,
                        overwrite,
                        delete_src,
                        Some(dst_dir.uid()),
                    )
                    .await?;
                }
            }

            batch.ops.push(Op::with_dst(
                self.alloc_op_uid(),
                batch.batch_uid,
                OpType::FinishDirCp,
                src_dir.clone(),
                dst_dir,
            ));

            if delete_src {
                self.stage_rm(batch, src_dir);
            }
            Ok(())
        })
    }

    /// Indexed children of a source node, from whichever tree owns it.
    async fn children_of_source(&self, src: &Node) -> EngineResult<Vec<Node>> {
        let device = src.device_uid();
        if let Some(store) = self.local_stores.read().await.get(&device) {
            return Ok(store.memory.children_of(src.uid()));
        }
        if let Some(store) = self.cloud_stores.read().await.get(&device) {
            return Ok(store.memory.children_of(src.uid()));
        }
        Err(EngineError::invariant(format!("Unknown device {device}")))
    }

    /// Enqueue a staged batch into the op graph.
    pub fn enqueue_batch(&self, batch: &Batch) -> EngineResult<()> {
        self.graph.enqueue_batch(batch)
    }

    /// Ensure the executor is running against the current set of trees.
    pub async fn start_executor(&self) -> EngineResult<Arc<OpExecutor>> {
        if let Some(executor) = self.executor.read().await.as_ref() {
            return Ok(executor.clone());
        }

        let ctx = Arc::new(CommandContext {
            local_stores: self.local_stores.read().await.clone(),
            cloud_stores: self.cloud_stores.read().await.clone(),
            cloud_client: self.cloud_client.read().await.clone(),
            staging: StagingArea::new(
                self.config.data_dir.join("staging"),
                self.config.staging_dir_name.clone(),
            ),
            hasher: ContentHasher::new(
                self.config.read_chunk_size,
                self.config.max_link_depth,
                HashFlavors {
                    md5: self.config.enable_md5_lookup,
                    sha256: self.config.enable_sha256,
                },
            ),
            expected_moves: self.expected_moves.clone(),
        });

        let executor = OpExecutor::new(
            self.graph.clone(),
            ctx,
            self.events.clone(),
            Duration::from_millis(self.config.op_timeout_ms),
        );
        executor.start();
        *self.executor.write().await = Some(executor.clone());
        Ok(executor)
    }

    /// Run a staged batch to completion (or until the executor pauses on a
    /// failure). Returns (completed, failed, pending).
    pub async fn apply_batch(&self, batch: &Batch) -> EngineResult<(usize, usize, usize)> {
        self.enqueue_batch(batch)?;
        let executor = self.start_executor().await?;

        loop {
            let (completed, failed, pending) = self.graph.batch_progress(batch.batch_uid);
            if pending == 0 {
                return Ok((completed, failed, pending));
            }
            if !executor.is_enabled() {
                // Stopped on an error; blocked dependents count as pending.
                return Ok((completed, failed, pending));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Traffic-light summary: RED until an initial load has happened, YELLOW
    /// while work is queued, GREEN when idle.
    pub fn summary(&self) -> EngineSummary {
        if !self.initial_load_done.load(Ordering::SeqCst) {
            return EngineSummary::Red;
        }
        if self.runner.pending_count() > 0 || self.graph.pending_op_count() > 0 {
            return EngineSummary::Yellow;
        }
        EngineSummary::Green
    }

    /// Shut everything down cooperatively.
    pub async fn shutdown(&self) {
        info!("Shutting down treesync engine");
        if let Some(executor) = self.executor.read().await.as_ref() {
            executor.shutdown();
        }
        self.graph.shutdown();
        self.monitor.shutdown();
        self.runner.shutdown();
    }

    /// The registered local tree containing `path` (deepest root wins),
    /// opened if not already.
    pub async fn local_store_for_path(&self, path: &str) -> EngineResult<Arc<LocalTreeStore>> {
        let path = normalize_path(path);
        let devices = self.registry.list_devices().await?;
        let best = devices
            .into_iter()
            .filter(|d| d.is_local())
            .filter(|d| path == d.label || path.starts_with(&format!("{}/", d.label)))
            .max_by_key(|d| d.label.len())
            .ok_or_else(|| {
                EngineError::node_not_found(format!(
                    "No registered local tree contains '{path}'"
                ))
            })?;
        self.add_local_tree(&best.label).await
    }

    async fn index_for_root(&self, root: &str) -> EngineResult<(Arc<MemoryIndex>, DeviceUid)> {
        let root = normalize_path(root);
        for store in self.local_stores.read().await.values() {
            if root == store.device.label || root.starts_with(&format!("{}/", store.device.label)) {
                return Ok((store.memory.clone(), store.device.uid));
            }
        }
        for store in self.cloud_stores.read().await.values() {
            if store.memory.node_for_path(&root).is_some() || root == "/" {
                return Ok((store.memory.clone(), store.device.uid));
            }
        }
        Err(EngineError::node_not_found(format!(
            "No registered tree contains '{root}'"
        )))
    }

    /// A planned directory node for a create op: a fresh uid at the target
    /// path, not yet live.
    async fn plan_dir_node(&self, device_uid: DeviceUid, path: &str) -> EngineResult<Node> {
        let path = normalize_path(path);
        let (uid, parent_uid) = self.plan_identity(device_uid, &path).await?;
        Ok(Node::Dir(DirNode {
            identifier: NodeIdentifier::new(device_uid, uid, path),
            parent_uids: vec![parent_uid],
            trashed: TrashStatus::NotTrashed,
            live: false,
            all_children_fetched: false,
            sync_ts: node::now_ts(),
            external_id: None,
        }))
    }

    /// A planned file node for a copy/move destination: identity at the
    /// target path, content expectations borrowed from the source.
    async fn plan_file_node(
        &self,
        device_uid: DeviceUid,
        path: &str,
        src: Option<&FileNode>,
    ) -> EngineResult<Node> {
        let path = normalize_path(path);
        let (uid, parent_uid) = self.plan_identity(device_uid, &path).await?;
        Ok(Node::File(FileNode {
            identifier: NodeIdentifier::new(device_uid, uid, path),
            parent_uids: vec![parent_uid],
            size_bytes: src.map(|s| s.size_bytes).unwrap_or(0),
            md5: src.and_then(|s| s.md5.clone()),
            sha256: None,
            sync_ts: node::now_ts(),
            modify_ts: src.map(|s| s.modify_ts).unwrap_or(0),
            change_ts: src.map(|s| s.change_ts).unwrap_or(0),
            trashed: TrashStatus::NotTrashed,
            live: false,
            external_id: None,
            version: None,
        }))
    }

    async fn plan_identity(
        &self,
        device_uid: DeviceUid,
        path: &str,
    ) -> EngineResult<(Uid, Uid)> {
        if let Some(store) = self.local_stores.read().await.get(&device_uid) {
            let uid = store.registry.uid_for_path(path, None);
            let parent_uid = match path_parent(path) {
                Some(parent) => store.registry.uid_for_path(parent, None),
                None => Uid::NULL,
            };
            return Ok((uid, parent_uid));
        }
        if let Some(store) = self.cloud_stores.read().await.get(&device_uid) {
            let uid = store.registry.next_uid();
            let parent_uid = match path_parent(path) {
                Some(parent) => store
                    .memory
                    .node_for_path(parent)
                    .map(|n| n.uid())
                    .unwrap_or(Uid::NULL),
                None => Uid::NULL,
            };
            return Ok((uid, parent_uid));
        }
        Err(EngineError::invariant(format!(
            "Unknown device {device_uid}"
        )))
    }

    fn alloc_op_uid(&self) -> Uid {
        Uid(self.next_op_uid.fetch_add(1, Ordering::SeqCst))
    }
}
