//! Time-windowed deduplication of sibling nodes.
//!
//! Elicitation can produce the same component twice under one parent when
//! listing turns overlap. Siblings sharing a normalized name and created
//! within one window collapse into the earliest member; the losers donate
//! their suppliers to the keeper's alternative-supplier list and are
//! deleted.

use std::collections::BTreeMap;

use carbonbom_shared::{Node, NodeId, NodeStatus, Result};
use carbonbom_store::NodeStore;
use chrono::Duration;
use tracing::{debug, info, instrument};

/// One planned merge: the surviving node and the duplicates to fold in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub keeper: NodeId,
    pub losers: Vec<NodeId>,
}

/// Plan merges for one sibling set. Pure: no I/O, deterministic.
///
/// Siblings are grouped by trimmed, case-folded name and walked in
/// `created_at` order. A window starts at its first member and admits every
/// later member within `window_secs` inclusive; a member past the cutoff
/// starts a new window. Only windows with more than one member produce a
/// plan, with the earliest member as keeper.
pub fn plan_merges(siblings: &[Node], window_secs: u64) -> Vec<MergePlan> {
    let window = Duration::seconds(window_secs as i64);

    let mut groups: BTreeMap<String, Vec<&Node>> = BTreeMap::new();
    for node in siblings {
        groups
            .entry(node.name.trim().to_lowercase())
            .or_default()
            .push(node);
    }

    let mut plans = Vec::new();
    for (_, mut group) in groups {
        group.sort_by_key(|n| (n.created_at, n.id.0));

        let mut i = 0;
        while i < group.len() {
            let anchor = group[i];
            let mut losers = Vec::new();
            let mut j = i + 1;
            while j < group.len() && group[j].created_at - anchor.created_at <= window {
                losers.push(group[j].id);
                j += 1;
            }
            if !losers.is_empty() {
                plans.push(MergePlan {
                    keeper: anchor.id,
                    losers,
                });
            }
            i = j;
        }
    }
    plans
}

/// Deduplicate the children of `parent` and return the surviving nodes in
/// creation order. Running again with no new arrivals is a no-op.
#[instrument(skip_all, fields(parent_id = %parent))]
pub async fn run(store: &NodeStore, parent: NodeId, window_secs: u64) -> Result<Vec<Node>> {
    let siblings = store.children_of(parent).await?;
    let plans = plan_merges(&siblings, window_secs);

    let mut merged = 0usize;
    for plan in &plans {
        debug!(keeper = %plan.keeper, losers = plan.losers.len(), "merging duplicates");
        store.merge_and_delete(plan.keeper, &plan.losers).await?;
        merged += plan.losers.len();
    }

    let survivors = store.children_of(parent).await?;
    for node in &survivors {
        store.set_status(node.id, NodeStatus::Deduped).await?;
    }

    info!(
        before = siblings.len(),
        merged,
        after = survivors.len(),
        "dedup complete"
    );
    Ok(survivors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbonbom_shared::{BomItem, TreeId};
    use chrono::{TimeZone, Utc};

    fn item(index: u32, name: &str, supplier: Option<&str>) -> BomItem {
        BomItem {
            index,
            name: name.into(),
            supplier: supplier.map(Into::into),
            description: None,
            mass: None,
            unit: None,
        }
    }

    fn sibling(parent: &Node, name: &str, supplier: Option<&str>, offset_secs: i64) -> Node {
        let mut node = Node::child_of(parent, &item(1, name, supplier));
        node.created_at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
            + Duration::seconds(offset_secs);
        node
    }

    #[test]
    fn same_name_within_window_is_grouped() {
        let root = Node::root(TreeId::new(), "Laptop");
        let a = sibling(&root, "Screw", None, 0);
        let b = sibling(&root, "screw", None, 540); // 9 min
        let c = sibling(&root, " SCREW ", None, 600); // exactly at the cutoff

        let plans = plan_merges(&[a.clone(), b.clone(), c.clone()], 600);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].keeper, a.id);
        assert_eq!(plans[0].losers, vec![b.id, c.id]);
    }

    #[test]
    fn window_is_anchored_at_first_member() {
        let root = Node::root(TreeId::new(), "Laptop");
        // 21 min after the anchor: outside the window even though it is
        // within 10 min of the previous member.
        let a = sibling(&root, "Screw", None, 0);
        let b = sibling(&root, "Screw", None, 540);
        let c = sibling(&root, "Screw", None, 1260);

        let plans = plan_merges(&[a.clone(), b.clone(), c.clone()], 600);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].keeper, a.id);
        assert_eq!(plans[0].losers, vec![b.id]);
        // c starts a new singleton window: no plan for it
    }

    #[test]
    fn different_names_never_merge() {
        let root = Node::root(TreeId::new(), "Laptop");
        let a = sibling(&root, "Screw", None, 0);
        let b = sibling(&root, "Bolt", None, 1);
        assert!(plan_merges(&[a, b], 600).is_empty());
    }

    #[test]
    fn keeper_is_earliest_regardless_of_input_order() {
        let root = Node::root(TreeId::new(), "Laptop");
        let early = sibling(&root, "Screw", None, 0);
        let late = sibling(&root, "Screw", None, 10);

        let plans = plan_merges(&[late.clone(), early.clone()], 600);
        assert_eq!(plans[0].keeper, early.id);
    }

    #[tokio::test]
    async fn run_merges_and_is_idempotent() {
        let tmp = std::env::temp_dir().join(format!("cbom_test_{}.db", uuid::Uuid::now_v7()));
        let store = NodeStore::open(&tmp).await.expect("open test db");

        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();

        let keeper = sibling(&root, "Screw", Some("Acme"), 0);
        let dup = sibling(&root, "screw", Some("BoltCo"), 60);
        let other = sibling(&root, "Screen", None, 0);
        store
            .insert_children_batch(&[keeper.clone(), dup.clone(), other.clone()])
            .await
            .unwrap();

        let survivors = run(&store, root.id, 600).await.expect("dedup");
        assert_eq!(survivors.len(), 2);
        assert!(survivors.iter().all(|n| n.status == NodeStatus::Deduped));

        let merged = store.get_node(keeper.id).await.unwrap().unwrap();
        assert_eq!(merged.alt_suppliers, vec!["BoltCo"]);
        assert!(store.get_node(dup.id).await.unwrap().is_none());

        // second pass with no new arrivals changes nothing
        let survivors = run(&store, root.id, 600).await.expect("dedup again");
        assert_eq!(survivors.len(), 2);
        let merged = store.get_node(keeper.id).await.unwrap().unwrap();
        assert_eq!(merged.alt_suppliers, vec!["BoltCo"]);
    }
}
