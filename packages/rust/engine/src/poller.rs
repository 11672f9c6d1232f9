//! Count-based tier convergence polling.
//!
//! A tier (the children of one parent) has converged when every tracked
//! progress flag has been set on every child. The check is a handful of
//! cheap count queries, so the poller never holds node data in memory and
//! sees work done by detached tasks as soon as it lands in the store.

use carbonbom_shared::{NodeId, ProgressFlag, Result};
use carbonbom_store::NodeStore;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Terminal states of a polling wait. A timeout is a signal for the
/// caller, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Converged,
    TimedOut,
}

/// One count-query pass: total children vs per-flag completion counts.
/// An empty tier is trivially converged.
pub async fn is_converged(store: &NodeStore, parent: NodeId) -> Result<bool> {
    let total = store.count_children(parent).await?;
    if total == 0 {
        return Ok(true);
    }
    for flag in ProgressFlag::tracked() {
        let done = store.count_children_with_flag(parent, flag).await?;
        if done != total {
            debug!(
                parent_id = %parent,
                flag = flag.column(),
                done,
                total,
                "tier not yet converged"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Poll at a fixed interval until the tier converges or the cycle budget
/// runs out.
#[instrument(skip_all, fields(parent_id = %parent))]
pub async fn wait_for_converged(
    store: &NodeStore,
    parent: NodeId,
    interval_secs: u64,
    max_cycles: u32,
) -> Result<Convergence> {
    for cycle in 1..=max_cycles.max(1) {
        if is_converged(store, parent).await? {
            info!(cycle, "tier converged");
            return Ok(Convergence::Converged);
        }
        debug!(cycle, max_cycles, "waiting for tier convergence");
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
    info!(max_cycles, "convergence wait timed out");
    Ok(Convergence::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbonbom_shared::{BomItem, Node, TreeId};

    async fn test_store() -> NodeStore {
        let tmp = std::env::temp_dir().join(format!("cbom_test_{}.db", uuid::Uuid::now_v7()));
        NodeStore::open(&tmp).await.expect("open test db")
    }

    fn item(index: u32, name: &str) -> BomItem {
        BomItem {
            index,
            name: name.into(),
            supplier: None,
            description: None,
            mass: None,
            unit: None,
        }
    }

    async fn set_all_tracked(store: &NodeStore, id: NodeId) {
        for flag in ProgressFlag::tracked() {
            store.set_flag(id, flag).await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_tier_is_trivially_converged() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();
        assert!(is_converged(&store, root.id).await.unwrap());
    }

    #[tokio::test]
    async fn partially_flagged_tier_is_not_converged() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();

        let a = Node::child_of(&root, &item(1, "Battery"));
        let b = Node::child_of(&root, &item(2, "Screen"));
        store.insert_children_batch(&[a.clone(), b.clone()]).await.unwrap();

        set_all_tracked(&store, a.id).await;
        assert!(!is_converged(&store, root.id).await.unwrap());

        // one flag still missing on b
        for flag in [
            ProgressFlag::Supplier,
            ProgressFlag::Mass,
            ProgressFlag::Address,
            ProgressFlag::Transport,
        ] {
            store.set_flag(b.id, flag).await.unwrap();
        }
        assert!(!is_converged(&store, root.id).await.unwrap());

        store.set_flag(b.id, ProgressFlag::Emissions).await.unwrap();
        assert!(is_converged(&store, root.id).await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_when_work_never_lands() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();
        let child = Node::child_of(&root, &item(1, "Battery"));
        store.insert_node(&child).await.unwrap();

        let result = wait_for_converged(&store, root.id, 0, 3).await.unwrap();
        assert_eq!(result, Convergence::TimedOut);
    }

    #[tokio::test]
    async fn wait_sees_concurrent_progress() {
        let store = std::sync::Arc::new(test_store().await);
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();
        let child = Node::child_of(&root, &item(1, "Battery"));
        store.insert_node(&child).await.unwrap();

        let writer_store = store.clone();
        let child_id = child.id;
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for flag in ProgressFlag::tracked() {
                writer_store.set_flag(child_id, flag).await.unwrap();
            }
        });

        let result = wait_for_converged(&store, root.id, 0, 10_000).await.unwrap();
        assert_eq!(result, Convergence::Converged);
        writer.await.unwrap();
    }
}
