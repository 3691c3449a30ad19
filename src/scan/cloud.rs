//! Cloud tree loader
//!
//! Downloads the whole account tree through a resumable state machine.
//! Every fetched page is committed together with the advanced page token,
//! so a crash restarts at the last committed page instead of from scratch.
//! Folders are fetched before files so parent relationships resolve; a
//! compile pass then translates provider parent ids into uids and builds
//! full path lists by BFS from the roots.
//!
//! The download runs in the task runner's lowest lane, one state-machine
//! step (one page fetch, one phase transition) per task, each finishing by
//! re-submitting a continuation task. A full-account crawl therefore never
//! starves scans, live updates, or user-visible loads.

use crate::cloud::{ChangeRecord, CloudClient, CloudItem};
use crate::db::cloud_store::{CurrentDownload, DownloadState, DownloadType, ParentMapping};
use crate::device::Uid;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::node::{DirNode, FileNode, Node, NodeIdentifier, TrashStatus};
use crate::store::CloudTreeStore;
use crate::tasks::{ExecPriority, Task, TaskRunner};
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

enum LoadStep {
    Continue(CurrentDownload),
    Finished(usize),
}

pub struct CloudTreeLoader {
    store: Arc<CloudTreeStore>,
    client: Arc<dyn CloudClient>,
    events: Arc<EventBus>,
    runner: Arc<TaskRunner>,
}

impl CloudTreeLoader {
    pub fn new(
        store: Arc<CloudTreeStore>,
        client: Arc<dyn CloudClient>,
        events: Arc<EventBus>,
        runner: Arc<TaskRunner>,
    ) -> Self {
        Self {
            store,
            client,
            events,
            runner,
        }
    }

    /// Load (or resume loading) the whole cloud tree into the index. The
    /// crawl itself runs as a chain of bulk-lane tasks; this future resolves
    /// when the chain reaches COMPLETE.
    pub async fn load_all(self: Arc<Self>, invalidate_cache: bool) -> EngineResult<usize> {
        let sync_ts = crate::node::now_ts();

        // A change cursor must exist before the crawl begins, otherwise
        // changes arriving mid-crawl would be lost.
        let changes = self.store.disk.get_current_download(DownloadType::Changes).await?;
        if changes.is_none() || invalidate_cache {
            debug!("Getting a new start token for changes (invalidate_cache={invalidate_cache})");
            let token = self.with_retry(|| self.client.get_changes_start_token()).await?;
            self.store
                .disk
                .create_or_update_download(&CurrentDownload::new(
                    DownloadType::Changes,
                    DownloadState::NotStarted,
                    Some(token),
                    sync_ts,
                ))
                .await?;
        }

        let download = match self
            .store
            .disk
            .get_current_download(DownloadType::InitialLoad)
            .await?
        {
            Some(d) if !invalidate_cache => d,
            _ => {
                info!("Starting a fresh download of the entire cloud tree");
                let d = CurrentDownload::new(
                    DownloadType::InitialLoad,
                    DownloadState::NotStarted,
                    None,
                    sync_ts,
                );
                self.store.disk.create_or_update_download(&d).await?;
                d
            }
        };

        if !download.is_complete() {
            let verb = if download.state == DownloadState::NotStarted {
                "Starting"
            } else {
                "Resuming"
            };
            info!("{verb} cloud tree download (state={:?})", download.state);
        }

        let (done_tx, done_rx) = oneshot::channel();
        Self::submit_step(self, download, done_tx);
        done_rx.await.map_err(|_| EngineError::Interrupted)?
    }

    /// Submit one state-machine step to the bulk lane. The step re-submits
    /// itself with the advanced cursor until the crawl completes.
    fn submit_step(
        loader: Arc<Self>,
        download: CurrentDownload,
        done_tx: oneshot::Sender<EngineResult<usize>>,
    ) {
        let runner = loader.runner.clone();
        runner.submit(Task::new(
            ExecPriority::P5CloudDownload,
            "cloud tree download",
            async move {
                match loader.step(download).await {
                    Ok(LoadStep::Continue(download)) => {
                        Self::submit_step(loader, download, done_tx)
                    }
                    Ok(LoadStep::Finished(count)) => {
                        let _ = done_tx.send(Ok(count));
                    }
                    Err(err) => {
                        let _ = done_tx.send(Err(err));
                    }
                }
            },
        ));
    }

    async fn step(&self, mut download: CurrentDownload) -> EngineResult<LoadStep> {
        match download.state {
            DownloadState::NotStarted => {
                // Fresh crawl: drop stale tree data before fetching anything.
                self.store.disk.truncate_tree().await?;
                download.state = DownloadState::GettingRoot;
                download.page_token = None;
                download.update_ts = crate::node::now_ts();
                self.store.disk.create_or_update_download(&download).await?;
                Ok(LoadStep::Continue(download))
            }
            DownloadState::GettingRoot => {
                // The root folder is never included in the listing calls.
                let root_item = self.with_retry(|| self.client.get_root()).await?;
                let root_node = self.item_to_node(&root_item, crate::node::now_ts());
                download.state = DownloadState::GettingDirs;
                download.page_token = None;
                download.update_ts = crate::node::now_ts();
                self.store
                    .disk
                    .insert_page(std::slice::from_ref(&root_node), &[], &download)
                    .await?;
                Ok(LoadStep::Continue(download))
            }
            DownloadState::GettingDirs => {
                let done = self.fetch_one_page(&mut download, true).await?;
                if done {
                    download.state = DownloadState::GettingFiles;
                    download.page_token = None;
                    self.store.disk.create_or_update_download(&download).await?;
                }
                Ok(LoadStep::Continue(download))
            }
            DownloadState::GettingFiles => {
                let done = self.fetch_one_page(&mut download, false).await?;
                if done {
                    download.state = DownloadState::ReadyToCompile;
                    download.page_token = None;
                    self.store.disk.create_or_update_download(&download).await?;
                }
                Ok(LoadStep::Continue(download))
            }
            DownloadState::ReadyToCompile => {
                self.compile(&mut download).await?;
                Ok(LoadStep::Continue(download))
            }
            DownloadState::Complete => {
                // Materialize into memory: links parents, compiles paths,
                // emits TREE_LOADED.
                let count = self.store.load_from_cache().await?;
                debug!("Cloud tree load done ({count} nodes)");
                Ok(LoadStep::Finished(count))
            }
        }
    }

    /// Fetch and persist one listing page. Returns true once the token
    /// stream has run dry.
    async fn fetch_one_page(
        &self,
        download: &mut CurrentDownload,
        dirs: bool,
    ) -> EngineResult<bool> {
        let sync_ts = crate::node::now_ts();
        let token = download.page_token.clone();
        let page = if dirs {
            self.with_retry(|| self.client.list_folders(token.as_deref())).await?
        } else {
            self.with_retry(|| self.client.list_files(token.as_deref())).await?
        };

        let mut nodes = Vec::with_capacity(page.items.len());
        let mut mappings = Vec::new();
        for item in &page.items {
            let node = self.item_to_node(item, sync_ts);
            for parent_id in &item.parent_ids {
                mappings.push(ParentMapping {
                    child_uid: node.uid(),
                    parent_uid: None,
                    external_parent_id: parent_id.clone(),
                    sync_ts,
                });
            }
            nodes.push(node);
        }

        let done = page.next_page_token.is_none();
        download.page_token = page.next_page_token;
        download.update_ts = crate::node::now_ts();
        self.store.disk.insert_page(&nodes, &mappings, download).await?;

        self.events.emit(Event::Progress {
            label: format!(
                "cloud {} download",
                if dirs { "folder" } else { "file" }
            ),
            done: nodes.len() as u64,
            total: 0,
        });

        Ok(done)
    }

    /// Compile pass: translate external parent ids to uids and mark every
    /// directory authoritative for its children.
    async fn compile(&self, download: &mut CurrentDownload) -> EngineResult<()> {
        let mappings = self.store.disk.get_id_parent_mappings().await?;
        debug!("Translating parent ids for {} mappings", mappings.len());

        let translated: Vec<ParentMapping> = mappings
            .into_iter()
            .map(|mut mapping| {
                let parent_uid = self
                    .store
                    .registry
                    .uid_for_external_id(&mapping.external_parent_id, None);
                mapping.parent_uid = Some(parent_uid);
                mapping
            })
            .collect();

        self.store.disk.replace_id_parent_mappings(&translated).await?;
        self.store.disk.mark_all_dirs_fetched().await?;

        download.state = DownloadState::Complete;
        download.page_token = None;
        download.update_ts = crate::node::now_ts();
        self.store.disk.create_or_update_download(download).await?;
        info!("Cloud tree download complete ({} parent mappings)", translated.len());
        Ok(())
    }

    /// Apply one round of the change stream. Returns how many change records
    /// were applied. Intended to be called on an interval by the live
    /// monitor's poll loop.
    pub async fn apply_changes(&self) -> EngineResult<usize> {
        let Some(mut cursor) = self
            .store
            .disk
            .get_current_download(DownloadType::Changes)
            .await?
        else {
            return Err(EngineError::invariant(
                "Change cursor missing; run load_all first",
            ));
        };

        let mut applied = 0usize;
        loop {
            let Some(token) = cursor.page_token.clone() else {
                return Err(EngineError::invariant("Change cursor has no token"));
            };
            let page = self.with_retry(|| self.client.list_changes(&token)).await?;

            for change in &page.changes {
                match change {
                    ChangeRecord::Upserted(item) => {
                        let node = self.change_item_to_node(item);
                        self.store.upsert_node(node).await?;
                        applied += 1;
                    }
                    ChangeRecord::Removed { id } => {
                        if let Some(node) = self.store.node_for_external_id(id) {
                            match self.store.remove_node(node.uid()).await {
                                Ok(_) => applied += 1,
                                Err(err) => {
                                    warn!("Cannot apply remote removal of {id}: {err}")
                                }
                            }
                        }
                    }
                }
            }

            let next = page
                .next_page_token
                .clone()
                .or(page.new_start_token.clone());
            let drained = page.next_page_token.is_none();
            cursor.page_token = next;
            cursor.update_ts = crate::node::now_ts();
            self.store.disk.create_or_update_download(&cursor).await?;

            if drained {
                break;
            }
        }

        if applied > 0 {
            debug!("Applied {applied} cloud changes");
        }
        Ok(applied)
    }

    fn item_to_node(&self, item: &CloudItem, sync_ts: i64) -> Node {
        let uid = self.store.registry.uid_for_external_id(&item.id, None);
        self.build_node(item, uid, Vec::new(), sync_ts)
    }

    /// Changes arrive after the compile pass, so parent uids are resolved
    /// eagerly and the node gets a live path list immediately.
    fn change_item_to_node(&self, item: &CloudItem) -> Node {
        let uid = self.store.registry.uid_for_external_id(&item.id, None);
        let parent_uids: Vec<Uid> = item
            .parent_ids
            .iter()
            .map(|id| self.store.registry.uid_for_external_id(id, None))
            .collect();

        let mut paths = Vec::new();
        for parent_uid in &parent_uids {
            if let Some(parent) = self.store.memory.get_node(*parent_uid) {
                for parent_path in parent.path_list() {
                    paths.push(crate::node::identifier::path_join(parent_path, &item.name));
                }
            }
        }
        if paths.is_empty() {
            paths.push(format!("/{}", item.name));
        }

        let mut node = self.build_node(item, uid, parent_uids, crate::node::now_ts());
        node.identifier_mut().path_list = paths;
        node
    }

    fn build_node(&self, item: &CloudItem, uid: Uid, parent_uids: Vec<Uid>, sync_ts: i64) -> Node {
        let device_uid = self.store.device.uid;
        let trashed = if item.trashed {
            TrashStatus::ExplicitlyTrashed
        } else {
            TrashStatus::NotTrashed
        };
        let identifier = NodeIdentifier::new(device_uid, uid, format!("/{}", item.name));
        if item.is_dir {
            Node::Dir(DirNode {
                identifier,
                parent_uids,
                trashed,
                live: true,
                all_children_fetched: false,
                sync_ts,
                external_id: Some(item.id.clone()),
            })
        } else {
            Node::File(FileNode {
                identifier,
                parent_uids,
                size_bytes: item.size_bytes,
                md5: item.md5.clone(),
                sha256: None,
                sync_ts,
                modify_ts: item.modify_ts,
                change_ts: item.create_ts,
                trashed,
                live: true,
                external_id: Some(item.id.clone()),
                version: item.version,
            })
        }
    }

    /// Retry transient provider failures with exponential backoff; permanent
    /// failures propagate immediately.
    async fn with_retry<T, F, Fut>(&self, call: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        backoff::future::retry(policy, || async {
            call().await.map_err(|err| {
                if err.is_transient() {
                    warn!("Transient cloud error, will retry: {err}");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        })
        .await
    }
}
