//! Op executor
//!
//! A single long-lived consumer of the op graph. Each op is dispatched to
//! its command, bounded by a timeout, and its result written back into the
//! affected tree's indices. A failed op leaves its dependents blocked and
//! pauses the executor until the operator resumes it; a timed-out op is
//! marked failed and the executor moves on.

use super::commands::{build_command, CommandContext};
use super::graph::OpGraph;
use super::{Op, OpResult, OpStatus};
use crate::device::TreeType;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::node::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct OpExecutor {
    graph: Arc<OpGraph>,
    ctx: Arc<CommandContext>,
    events: Arc<EventBus>,
    enable_tx: watch::Sender<bool>,
    op_timeout: Duration,
}

impl OpExecutor {
    pub fn new(
        graph: Arc<OpGraph>,
        ctx: Arc<CommandContext>,
        events: Arc<EventBus>,
        op_timeout: Duration,
    ) -> Arc<Self> {
        let (enable_tx, _) = watch::channel(true);
        Arc::new(Self {
            graph,
            ctx,
            events,
            enable_tx,
            op_timeout,
        })
    }

    /// Spawn the consumer loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
        })
    }

    /// Gate the loop. Firing the signal lets the presentation layer reflect
    /// the paused/running state.
    pub fn set_enabled(&self, enabled: bool) {
        if *self.enable_tx.borrow() != enabled {
            let _ = self.enable_tx.send(enabled);
            self.events.emit(Event::OpExecutionStateChanged { enabled });
            info!(
                "Op execution {}",
                if enabled { "resumed" } else { "paused" }
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enable_tx.borrow()
    }

    /// Wake the loop so it can observe graph shutdown and exit.
    pub fn shutdown(&self) {
        self.graph.shutdown();
        let _ = self.enable_tx.send(true);
    }

    async fn run(&self) {
        info!("Op executor started");
        let mut enable_rx = self.enable_tx.subscribe();

        loop {
            // Block while paused.
            while !*enable_rx.borrow() {
                if enable_rx.changed().await.is_err() {
                    return;
                }
            }

            let Some(op) = self.graph.next_command().await else {
                break;
            };
            debug!("Executing {op}");

            let result = self.execute_one(&op).await;
            let status = result.status;
            if let Err(err) = self.apply_result(&op, result).await {
                error!("Failed writing back result of {op}: {err}");
            }

            self.graph.mark_completed(op.op_uid, status);

            if status == OpStatus::StoppedOnError {
                // Dependents stay blocked; stop consuming until the operator
                // resumes.
                self.set_enabled(false);
            }
        }
        info!("Op executor exited");
    }

    async fn execute_one(&self, op: &Arc<Op>) -> OpResult {
        let src_tree = match self.tree_type_of(op.src_node.device_uid()) {
            Some(tree) => tree,
            None => {
                return OpResult::error(format!(
                    "No store for source device {}",
                    op.src_node.device_uid()
                ))
            }
        };
        let dst_tree = match &op.dst_node {
            Some(dst) => match self.tree_type_of(dst.device_uid()) {
                Some(tree) => Some(tree),
                None => {
                    return OpResult::error(format!(
                        "No store for destination device {}",
                        dst.device_uid()
                    ))
                }
            },
            None => None,
        };

        let command = match build_command(op.clone(), src_tree, dst_tree) {
            Ok(command) => command,
            Err(err) => return OpResult::error(err.to_string()),
        };

        match tokio::time::timeout(self.op_timeout, command.execute(&self.ctx)).await {
            Ok(Ok(result)) => result,
            Ok(Err(EngineError::IdenticalFileExists)) => {
                // Soft error: the work is already done.
                OpResult::no_op()
            }
            Ok(Err(err)) => {
                warn!("{} failed: {err}", command.description());
                OpResult::error(err.to_string())
            }
            Err(_) => {
                warn!(
                    "{} timed out after {:?}",
                    command.description(),
                    self.op_timeout
                );
                OpResult::error(
                    EngineError::Timeout(self.op_timeout).to_string(),
                )
            }
        }
    }

    /// Write the op's node changes through to the right tree stores and
    /// surface errors to the presentation layer.
    async fn apply_result(&self, op: &Arc<Op>, result: OpResult) -> EngineResult<()> {
        for node in result.to_upsert {
            self.upsert_into_tree(node).await?;
        }
        for (device_uid, uid) in result.to_remove {
            if let Some(store) = self.ctx.local_stores.get(&device_uid) {
                store.remove_node(uid).await?;
            } else if let Some(store) = self.ctx.cloud_stores.get(&device_uid) {
                store.remove_node(uid).await?;
            }
        }

        if result.status == OpStatus::StoppedOnError {
            self.events.emit(Event::ErrorOccurred {
                context: format!("{op}"),
                message: result
                    .error
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(())
    }

    fn tree_type_of(&self, device_uid: crate::device::DeviceUid) -> Option<TreeType> {
        if self.ctx.local_stores.contains_key(&device_uid) {
            Some(TreeType::LocalDisk)
        } else if self.ctx.cloud_stores.contains_key(&device_uid) {
            Some(TreeType::Cloud)
        } else {
            None
        }
    }

    async fn upsert_into_tree(&self, node: Node) -> EngineResult<()> {
        let device_uid = node.device_uid();
        if let Some(store) = self.ctx.local_stores.get(&device_uid) {
            store.upsert_node(node).await?;
        } else if let Some(store) = self.ctx.cloud_stores.get(&device_uid) {
            store.upsert_node(node).await?;
        } else {
            return Err(EngineError::invariant(format!(
                "No store for device {device_uid}"
            )));
        }
        Ok(())
    }
}
