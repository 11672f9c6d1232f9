//! Tier expansion controller.
//!
//! Drives one node through decompose → dedup → enrich → converge, then
//! recurses into the surviving children as detached tasks. Recursion is
//! observed only through store state: a parent never holds handles to its
//! descendants' work.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use carbonbom_shared::{
    EngineConfig, MassUnit, Node, NodeId, NodeStatus, ProgressFlag, Result, TreeId, Verdict,
};
use carbonbom_store::NodeStore;
use carbonbom_oracle::Oracle;
use tracing::{info, instrument, warn};

use crate::enrichment::BatchOutcome;
use crate::poller::Convergence;
use crate::{EngineProgress, SilentProgress, dedup, elicitor, enrichment, poller};

/// What one tier expansion produced.
#[derive(Debug)]
pub struct TierOutcome {
    /// Surviving children after dedup.
    pub children: Vec<NodeId>,
    pub convergence: Convergence,
    pub batch: BatchOutcome,
}

/// Exit contract of a whole-tree run.
#[derive(Debug)]
pub struct ExpandReport {
    /// Nodes this run touched at the root tier (root + survivors).
    pub touched: Vec<NodeId>,
    /// Whether the root tier converged within the poll budget.
    pub converged: bool,
    /// Enrichment pipelines that failed or degraded.
    pub failed: usize,
}

/// The decomposition engine: store + oracle + configuration.
#[derive(Clone)]
pub struct Engine {
    store: Arc<NodeStore>,
    oracle: Arc<dyn Oracle>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<NodeStore>, oracle: Arc<dyn Oracle>, config: EngineConfig) -> Self {
        Self {
            store,
            oracle,
            config,
        }
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Create a new decomposition tree for a root product.
    pub async fn start_tree(
        &self,
        name: &str,
        mass: Option<f64>,
        unit: Option<MassUnit>,
        supplier: Option<String>,
    ) -> Result<Node> {
        let mut root = Node::root(TreeId::new(), name);
        root.mass = mass;
        root.mass_unit = unit;
        root.flags.supplier_done = supplier.is_some();
        root.supplier_name = supplier;

        self.store.insert_tree(&root).await?;
        info!(tree_id = %root.tree_id, node_id = %root.id, name, "tree created");
        Ok(root)
    }

    /// Expand one node by a single tier.
    ///
    /// Returns `Ok(None)` when the node is skipped: already decomposed,
    /// terminal or intangible, or at the depth cap. Otherwise runs the full
    /// elicit → dedup → enrich → poll sequence and kicks off detached
    /// recursion into non-terminal survivors.
    #[instrument(skip_all, fields(node_id = %id))]
    pub async fn expand(
        &self,
        id: NodeId,
        progress: &dyn EngineProgress,
    ) -> Result<Option<TierOutcome>> {
        let node = self
            .store
            .get_node(id)
            .await?
            .ok_or_else(|| carbonbom_shared::CarbonBomError::validation(format!(
                "node {id} not found"
            )))?;

        if node.is_terminal || node.is_intangible {
            self.store.set_status(id, NodeStatus::Terminal).await?;
            info!("skipping terminal node");
            return Ok(None);
        }
        if node.tier >= self.config.depth_cap {
            self.store.apply_verdict(id, Verdict::Terminal).await?;
            self.store.set_status(id, NodeStatus::Terminal).await?;
            info!(tier = node.tier, cap = self.config.depth_cap, "depth cap reached");
            return Ok(None);
        }
        if self.store.count_children(id).await? > 0 {
            info!("node already has children, skipping expansion");
            return Ok(None);
        }

        elicitor::elicit_children(
            &self.store,
            self.oracle.as_ref(),
            &self.config,
            &node,
            progress,
        )
        .await?;

        progress.phase("Deduplicating siblings");
        let survivors = dedup::run(&self.store, id, self.config.dedup_window_secs).await?;
        let survivor_ids: Vec<NodeId> = survivors.iter().map(|n| n.id).collect();

        let batch = enrichment::enrich_batch(
            self.store.clone(),
            self.oracle.clone(),
            &self.config,
            survivor_ids.clone(),
            progress,
        )
        .await;

        progress.phase("Waiting for tier convergence");
        let convergence = poller::wait_for_converged(
            &self.store,
            id,
            self.config.poll_interval_secs,
            self.config.max_poll_cycles,
        )
        .await?;

        if convergence == Convergence::Converged {
            self.store.set_status(id, NodeStatus::Converged).await?;
            self.recurse_into_survivors(&survivor_ids).await?;
        } else {
            warn!("tier did not converge, leaving children unexpanded");
        }

        Ok(Some(TierOutcome {
            children: survivor_ids,
            convergence,
            batch,
        }))
    }

    /// Spawn a detached expansion per non-terminal survivor. Progress of
    /// the spawned work is visible only through the store.
    async fn recurse_into_survivors(&self, survivors: &[NodeId]) -> Result<()> {
        for &child_id in survivors {
            let Some(child) = self.store.get_node(child_id).await? else {
                continue;
            };
            if child.is_terminal || child.is_intangible {
                self.store.set_status(child_id, NodeStatus::Terminal).await?;
                continue;
            }
            self.store
                .set_status(child_id, NodeStatus::Recursing)
                .await?;
            tokio::spawn(detach_expand(self.clone(), child_id));
        }
        Ok(())
    }

    /// Expand the root and wait for its tier to converge.
    #[instrument(skip_all, fields(root_id = %root))]
    pub async fn run_tree(
        &self,
        root: NodeId,
        progress: &dyn EngineProgress,
    ) -> Result<ExpandReport> {
        match self.expand(root, progress).await? {
            Some(outcome) => {
                let mut touched = vec![root];
                touched.extend(outcome.children.iter().copied());
                Ok(ExpandReport {
                    touched,
                    converged: outcome.convergence == Convergence::Converged,
                    failed: outcome.batch.failed,
                })
            }
            None => Ok(ExpandReport {
                touched: vec![root],
                converged: poller::is_converged(&self.store, root).await?,
                failed: 0,
            }),
        }
    }

    /// Clear a node's progress flags and run the enrichment pipeline over
    /// it again. The sole path that unsets flags.
    ///
    /// The node's previous emission contribution is retracted from itself
    /// and every ancestor before re-enriching, so the re-run does not
    /// double-count into the roll-up totals.
    #[instrument(skip_all, fields(node_id = %id))]
    pub async fn reprocess(
        &self,
        id: NodeId,
        progress: &dyn EngineProgress,
    ) -> Result<BatchOutcome> {
        let node = self
            .store
            .get_node(id)
            .await?
            .ok_or_else(|| carbonbom_shared::CarbonBomError::validation(format!(
                "node {id} not found"
            )))?;

        let prior = node.estimated_emissions + node.transport_emissions;
        if prior > 0.0 {
            self.store.increment_emissions(id, -prior).await?;
            let mut cursor = node.parent_id;
            while let Some(ancestor_id) = cursor {
                self.store.increment_emissions(ancestor_id, -prior).await?;
                cursor = self
                    .store
                    .get_node(ancestor_id)
                    .await?
                    .and_then(|a| a.parent_id);
            }
        }

        self.store.clear_flags(id).await?;
        let batch = enrichment::enrich_batch(
            self.store.clone(),
            self.oracle.clone(),
            &self.config,
            vec![id],
            progress,
        )
        .await;

        // Existing children stay valid; restore the decomposition flag the
        // blanket clear removed.
        if self.store.count_children(id).await? > 0 {
            self.store.set_flag(id, ProgressFlag::Decomposition).await?;
        }

        // Settle the status again: terminality may have changed during the
        // re-run, otherwise the pre-reprocess state still holds.
        let terminal_now = self
            .store
            .get_node(id)
            .await?
            .is_some_and(|n| n.is_terminal);
        if terminal_now {
            self.store.set_status(id, NodeStatus::Terminal).await?;
        } else {
            self.store.set_status(id, node.status).await?;
        }

        info!(?batch, "node reprocessed");
        Ok(batch)
    }
}

/// Boxed entry point for the detached recursion, so the spawned future has
/// a concrete type instead of `expand`'s opaque one. Failures are reported
/// through logs only.
fn detach_expand(engine: Engine, id: NodeId) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if let Err(e) = engine.expand(id, &SilentProgress).await {
            warn!(node_id = %id, error = %e, "detached expansion failed");
        }
    })
}
