//! Settle-all enrichment fan-out.
//!
//! Every node in a batch runs the same per-node pipeline concurrently:
//! supplier, terminal verdict, mass, address, transport, emissions. One
//! node's failure never aborts its siblings; the batch always settles and
//! reports counts. Each step is gated by its progress flag, so re-running
//! a partially enriched node only does the remaining work.

use std::sync::Arc;

use carbonbom_shared::{
    CarbonBomError, EngineConfig, Node, NodeId, NodeStatus, ProgressFlag, Result, Verdict,
};
use carbonbom_store::NodeStore;
use carbonbom_oracle::{
    ChatMessage, ElicitRequest, Oracle, OracleReply, call_with_escalation, parser,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::EngineProgress;

/// Settled counts for one enrichment batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Nodes that completed every step cleanly.
    pub enriched: usize,
    /// Nodes that errored out or degraded on at least one step.
    pub failed: usize,
    /// Escalations to the secondary model across the batch.
    pub escalations: usize,
    /// Mass lookups that fell back to estimation.
    pub fallbacks: usize,
}

/// Per-node tallies returned by the pipeline.
#[derive(Debug, Default)]
struct NodeStats {
    escalations: usize,
    fallbacks: usize,
    /// At least one step gave up and logged instead of producing data.
    degraded: bool,
}

/// Run the enrichment pipeline over every node in `ids`, settling all of
/// them regardless of individual failures.
#[instrument(skip_all, fields(batch = ids.len()))]
pub async fn enrich_batch(
    store: Arc<NodeStore>,
    oracle: Arc<dyn Oracle>,
    config: &EngineConfig,
    ids: Vec<NodeId>,
    progress: &dyn EngineProgress,
) -> BatchOutcome {
    let total = ids.len();
    progress.phase("Enriching components");

    let semaphore = Arc::new(Semaphore::new(config.enrich_concurrency.max(1) as usize));
    let mut set: JoinSet<(NodeId, Result<NodeStats>)> = JoinSet::new();

    for id in ids {
        let store = store.clone();
        let oracle = oracle.clone();
        let config = config.clone();
        let sem = semaphore.clone();
        set.spawn(async move {
            let _permit = sem.acquire().await.expect("semaphore closed");
            let result = enrich_node(&store, oracle.as_ref(), &config, id).await;
            (id, result)
        });
    }

    let mut outcome = BatchOutcome::default();
    let mut settled = 0usize;
    while let Some(joined) = set.join_next().await {
        settled += 1;
        match joined {
            Ok((id, Ok(stats))) => {
                outcome.escalations += stats.escalations;
                outcome.fallbacks += stats.fallbacks;
                if stats.degraded {
                    outcome.failed += 1;
                } else {
                    outcome.enriched += 1;
                }
                progress.task_progress(settled, total, &format!("enriched {id}"));
            }
            Ok((id, Err(e))) => {
                warn!(node_id = %id, error = %e, "enrichment pipeline failed");
                outcome.failed += 1;
                progress.task_progress(settled, total, &format!("failed {id}"));
            }
            Err(e) => {
                warn!(error = %e, "enrichment task panicked");
                outcome.failed += 1;
            }
        }
    }

    debug!(?outcome, "enrichment batch settled");
    outcome
}

/// Run the six-step pipeline for one node.
async fn enrich_node(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    id: NodeId,
) -> Result<NodeStats> {
    let node = store
        .get_node(id)
        .await?
        .ok_or_else(|| CarbonBomError::validation(format!("node {id} not found")))?;
    store.set_status(id, NodeStatus::Enriching).await?;

    let mut stats = NodeStats::default();

    if !node.flags.supplier_done {
        resolve_supplier(store, oracle, config, &node, &mut stats).await?;
        store.set_flag(id, ProgressFlag::Supplier).await?;
    }

    // Verdict before mass: intangible components are exempt from the
    // physical steps. Re-asking on a rerun is harmless.
    let node = reload(store, id).await?;
    if !node.flags.transport_done && !node.is_terminal && node.tier < config.depth_cap {
        resolve_verdict(store, oracle, config, &node, &mut stats).await?;
    } else if !node.is_terminal && node.tier >= config.depth_cap {
        store.apply_verdict(id, Verdict::Terminal).await?;
    }

    let node = reload(store, id).await?;
    if !node.flags.mass_done {
        if !node.is_intangible {
            resolve_mass(store, oracle, config, &node, &mut stats).await?;
        }
        store.set_flag(id, ProgressFlag::Mass).await?;
    }

    let node = reload(store, id).await?;
    if !node.flags.address_done {
        if node.supplier_name.is_some() {
            resolve_address(store, oracle, config, &node, &mut stats).await?;
        }
        store.set_flag(id, ProgressFlag::Address).await?;
    }

    let node = reload(store, id).await?;
    if !node.flags.transport_done {
        if node.is_intangible {
            store.update_transport_emissions(id, 0.0).await?;
        } else {
            resolve_transport(store, oracle, config, &node, &mut stats).await?;
        }
        store.set_flag(id, ProgressFlag::Transport).await?;
    }

    let node = reload(store, id).await?;
    if !node.flags.emissions_done {
        resolve_emissions(store, oracle, config, &node, &mut stats).await?;
        store.set_flag(id, ProgressFlag::Emissions).await?;
    }

    // Aggregate flag: the whole pipeline has settled, degraded or not.
    store.set_flag(id, ProgressFlag::Enrichment).await?;

    Ok(stats)
}

async fn reload(store: &NodeStore, id: NodeId) -> Result<Node> {
    store
        .get_node(id)
        .await?
        .ok_or_else(|| CarbonBomError::validation(format!("node {id} disappeared")))
}

fn one_question(text: String) -> Vec<ChatMessage> {
    vec![ChatMessage::user(text)]
}

async fn record_escalation_telemetry(
    store: &NodeStore,
    config: &EngineConfig,
    id: NodeId,
    task: &str,
    outcome: &carbonbom_oracle::EscalationOutcome,
    stats: &mut NodeStats,
) -> Result<()> {
    if outcome.escalated {
        stats.escalations += 1;
        store
            .record_escalation(
                id,
                task,
                &config.primary_model,
                &config.secondary_model,
                outcome.escalation_worked,
            )
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline steps
// ---------------------------------------------------------------------------

/// Step 1: supplier identification. An unknown supplier marks the node
/// terminal.
async fn resolve_supplier(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    node: &Node,
    stats: &mut NodeStats,
) -> Result<()> {
    let prompt = format!(
        "Identify the most likely supplier of this component.\n\
         Component: {}\nContext chain: {}\n\
         Answer with exactly one line:\n*supplier: <company name or Unknown>",
        node.name, node.chain_summary
    );
    let accept = |r: &OracleReply| parser::parse_supplier(&r.text).is_ok();

    let supplier = match call_with_escalation(
        oracle,
        &config.primary_model,
        &config.secondary_model,
        one_question(prompt),
        accept,
    )
    .await
    {
        Ok((reply, outcome)) => {
            record_escalation_telemetry(store, config, node.id, "supplier", &outcome, stats)
                .await?;
            parser::parse_supplier(&reply.text).unwrap_or_else(|e| {
                warn!(node_id = %node.id, error = %e, "supplier reply unparsable, treating as unknown");
                stats.degraded = true;
                None
            })
        }
        Err(e) => {
            warn!(node_id = %node.id, error = %e, "supplier lookup failed, treating as unknown");
            stats.degraded = true;
            None
        }
    };

    match supplier {
        Some(name) => store.update_supplier(node.id, &name).await?,
        None => store.apply_verdict(node.id, Verdict::Terminal).await?,
    }
    Ok(())
}

/// Step 2: terminal verdict. Failure defaults to terminal.
async fn resolve_verdict(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    node: &Node,
    stats: &mut NodeStats,
) -> Result<()> {
    let prompt = format!(
        "Give a decomposition verdict for this component.\n\
         Component: {}\nContext chain: {}\n\
         Answer with exactly one line:\n\
         *verdict: <continue|done|software_or_service>\n\
         Use done for raw materials or parts with no meaningful sub-components, \
         software_or_service for intangibles.",
        node.name, node.chain_summary
    );

    let verdict = match oracle
        .elicit(ElicitRequest {
            model: config.primary_model.clone(),
            messages: one_question(prompt),
        })
        .await
    {
        Ok(reply) => parser::parse_verdict(&reply.text).unwrap_or_else(|e| {
            warn!(node_id = %node.id, error = %e, "verdict unparsable, defaulting to terminal");
            stats.degraded = true;
            Verdict::Terminal
        }),
        Err(e) => {
            warn!(node_id = %node.id, error = %e, "verdict call failed, defaulting to terminal");
            stats.degraded = true;
            Verdict::Terminal
        }
    };

    store.apply_verdict(node.id, verdict).await
}

/// Step 3: mass. Exact lookup first (with escalation), then the estimation
/// fallback that must commit to a number and justify it. Both failing still
/// completes the step — with no mass recorded.
async fn resolve_mass(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    node: &Node,
    stats: &mut NodeStats,
) -> Result<()> {
    let mut resolved = node.mass.zip(node.mass_unit);

    if resolved.is_none() {
        let prompt = format!(
            "State the exact mass of this component if it is publicly documented.\n\
             Component: {}\nContext chain: {}\n\
             Answer with:\n*mass_value: <number or Unknown>\n*mass_unit: <g|kg|mg|t|lb|oz>",
            node.name, node.chain_summary
        );
        let accept =
            |r: &OracleReply| matches!(parser::parse_mass_exact(&r.text), Ok(Some(_)));

        match call_with_escalation(
            oracle,
            &config.primary_model,
            &config.secondary_model,
            one_question(prompt),
            accept,
        )
        .await
        {
            Ok((reply, outcome)) => {
                record_escalation_telemetry(store, config, node.id, "mass_exact", &outcome, stats)
                    .await?;
                if let Ok(Some((mass, unit))) = parser::parse_mass_exact(&reply.text) {
                    store.update_mass(node.id, mass, unit, false, None).await?;
                    resolved = Some((mass, unit));
                }
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "exact mass lookup failed");
            }
        }
    }

    if resolved.is_none() {
        stats.fallbacks += 1;
        let prompt = format!(
            "Estimate the mass of this component. You must commit to a number.\n\
             Component: {}\nContext chain: {}\n\
             Answer with:\n*mass_value: <number>\n*mass_unit: <g|kg|mg|t|lb|oz>\n\
             *reasoning: <one line justifying the estimate>",
            node.name, node.chain_summary
        );
        let accept = |r: &OracleReply| parser::parse_mass_estimate(&r.text).is_ok();

        match call_with_escalation(
            oracle,
            &config.primary_model,
            &config.secondary_model,
            one_question(prompt),
            accept,
        )
        .await
        {
            Ok((reply, outcome)) => {
                record_escalation_telemetry(
                    store,
                    config,
                    node.id,
                    "mass_estimate",
                    &outcome,
                    stats,
                )
                .await?;
                match parser::parse_mass_estimate(&reply.text) {
                    Ok((mass, unit, reasoning)) => {
                        store
                            .update_mass(node.id, mass, unit, true, Some(&reasoning))
                            .await?;
                        resolved = Some((mass, unit));
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "mass estimate unparsable, leaving mass unset");
                        stats.degraded = true;
                    }
                }
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "mass estimation failed, leaving mass unset");
                stats.degraded = true;
            }
        }
    }

    // Percentage of parent mass, when both convert to grams.
    if let (Some((mass, unit)), Some(parent_id)) = (resolved, node.parent_id) {
        if let Some(parent) = store.get_node(parent_id).await? {
            if let Some(parent_grams) = parent.mass_grams() {
                if parent_grams > 0.0 {
                    let pct = unit.to_grams(mass) / parent_grams * 100.0;
                    store
                        .update_percentages(node.id, Some(pct), None)
                        .await?;
                }
            }
        }
    }
    Ok(())
}

/// Step 4: supplier address, with country-of-origin fallback.
async fn resolve_address(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    node: &Node,
    stats: &mut NodeStats,
) -> Result<()> {
    let supplier = node.supplier_name.as_deref().unwrap_or_default();
    let prompt = format!(
        "Find the supplier address for this component, or failing that its \
         country of origin.\n\
         Component: {}\nSupplier: {supplier}\nContext chain: {}\n\
         Answer with:\n*supplier_address: <address or Unknown>\n\
         *country_of_origin: <country or Unknown>\n\
         *origin_estimated: <yes|no>",
        node.name, node.chain_summary
    );
    let accept = |r: &OracleReply| parser::parse_address(&r.text).is_ok();

    match call_with_escalation(
        oracle,
        &config.primary_model,
        &config.secondary_model,
        one_question(prompt),
        accept,
    )
    .await
    {
        Ok((reply, outcome)) => {
            record_escalation_telemetry(store, config, node.id, "address", &outcome, stats)
                .await?;
            match parser::parse_address(&reply.text) {
                Ok(addr) => {
                    store
                        .update_address(
                            node.id,
                            addr.address.as_deref(),
                            addr.country.as_deref(),
                            addr.estimated,
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "address reply unparsable");
                    stats.degraded = true;
                }
            }
        }
        Err(e) => {
            warn!(node_id = %node.id, error = %e, "address lookup failed");
            stats.degraded = true;
        }
    }
    Ok(())
}

/// Step 5: transport-leg emissions.
async fn resolve_transport(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    node: &Node,
    stats: &mut NodeStats,
) -> Result<()> {
    let origin = node
        .supplier_address
        .as_deref()
        .or(node.country_of_origin.as_deref())
        .unwrap_or("Unknown");
    let prompt = format!(
        "Estimate the transport emissions in kgCO2e for shipping this component \
         from its origin to assembly.\n\
         Component: {}\nOrigin: {origin}\nContext chain: {}\n\
         Answer with exactly one line:\n*cf_value: <number>",
        node.name, node.chain_summary
    );

    let value = match oracle
        .elicit(ElicitRequest {
            model: config.primary_model.clone(),
            messages: one_question(prompt),
        })
        .await
    {
        Ok(reply) => parser::parse_emissions(&reply.text).unwrap_or_else(|e| {
            warn!(node_id = %node.id, error = %e, "transport emissions unparsable, using zero");
            stats.degraded = true;
            0.0
        }),
        Err(e) => {
            warn!(node_id = %node.id, error = %e, "transport emissions call failed, using zero");
            stats.degraded = true;
            0.0
        }
    };

    store.update_transport_emissions(node.id, value).await
}

/// Step 6: production emissions, plus atomic roll-up into every ancestor.
async fn resolve_emissions(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    node: &Node,
    stats: &mut NodeStats,
) -> Result<()> {
    let mass = node
        .mass
        .zip(node.mass_unit)
        .map(|(m, u)| format!("{m}{}", u.as_str()))
        .unwrap_or_else(|| "unknown".into());
    let prompt = format!(
        "Estimate the production emissions in kgCO2e for this component.\n\
         Component: {}\nMass: {mass}\nContext chain: {}\n\
         Answer with exactly one line:\n*cf_value: <number>",
        node.name, node.chain_summary
    );

    let production = match oracle
        .elicit(ElicitRequest {
            model: config.primary_model.clone(),
            messages: one_question(prompt),
        })
        .await
    {
        Ok(reply) => parser::parse_emissions(&reply.text).unwrap_or_else(|e| {
            warn!(node_id = %node.id, error = %e, "production emissions unparsable, using zero");
            stats.degraded = true;
            0.0
        }),
        Err(e) => {
            warn!(node_id = %node.id, error = %e, "production emissions call failed, using zero");
            stats.degraded = true;
            0.0
        }
    };

    store.update_estimated_emissions(node.id, production).await?;

    // Own total rolls up into the node itself and every ancestor, by
    // atomic in-database increments only.
    let own_total = production + reload(store, node.id).await?.transport_emissions;
    if own_total > 0.0 {
        store.increment_emissions(node.id, own_total).await?;
        let mut cursor = node.parent_id;
        while let Some(ancestor_id) = cursor {
            store.increment_emissions(ancestor_id, own_total).await?;
            cursor = store
                .get_node(ancestor_id)
                .await?
                .and_then(|a| a.parent_id);
        }
    }

    if let Some(parent_id) = node.parent_id {
        if let Some(parent) = store.get_node(parent_id).await? {
            if parent.estimated_emissions > 0.0 {
                let pct = production / parent.estimated_emissions * 100.0;
                store.update_percentages(node.id, None, Some(pct)).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use carbonbom_shared::{AppConfig, BomItem, TreeId};
    use std::sync::Mutex;

    use crate::SilentProgress;

    /// Oracle routing each question by a keyword in the last user message.
    /// Routes are `(keyword, reply-or-error)`; unmatched questions error.
    struct KeywordOracle {
        routes: Vec<(&'static str, std::result::Result<&'static str, &'static str>)>,
        calls: Mutex<usize>,
    }

    impl KeywordOracle {
        fn new(
            routes: Vec<(&'static str, std::result::Result<&'static str, &'static str>)>,
        ) -> Self {
            Self {
                routes,
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().expect("lock")
        }
    }

    #[async_trait]
    impl Oracle for KeywordOracle {
        async fn elicit(&self, request: ElicitRequest) -> Result<OracleReply> {
            *self.calls.lock().expect("lock") += 1;
            let question = &request.messages.last().expect("non-empty").content;
            for (keyword, reply) in &self.routes {
                if question.contains(keyword) {
                    return match reply {
                        Ok(text) => Ok(OracleReply {
                            text: (*text).into(),
                            is_incomplete: false,
                        }),
                        Err(e) => Err(CarbonBomError::Oracle((*e).into())),
                    };
                }
            }
            Err(CarbonBomError::Oracle(format!("no route for: {question}")))
        }
    }

    fn happy_routes()
    -> Vec<(&'static str, std::result::Result<&'static str, &'static str>)> {
        vec![
            ("supplier of this component", Ok("*supplier: CellCo")),
            ("decomposition verdict", Ok("*verdict: done")),
            ("exact mass", Ok("*mass_value: 50\n*mass_unit: g")),
            (
                "supplier address",
                Ok("*country_of_origin: Japan\n*origin_estimated: yes"),
            ),
            ("transport emissions", Ok("*cf_value: 0.5")),
            ("production emissions", Ok("*cf_value: 2.0")),
        ]
    }

    async fn test_store() -> Arc<NodeStore> {
        let tmp = std::env::temp_dir().join(format!("cbom_test_{}.db", uuid::Uuid::now_v7()));
        Arc::new(NodeStore::open(&tmp).await.expect("open test db"))
    }

    fn engine_config() -> EngineConfig {
        EngineConfig::from(&AppConfig::default())
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

    async fn seed_child(store: &NodeStore, name: &str) -> (Node, Node) {
        let mut root = Node::root(TreeId::new(), "Laptop");
        root.mass = Some(1.0);
        root.mass_unit = Some(carbonbom_shared::MassUnit::Kg);
        store.insert_tree(&root).await.unwrap();
        let child = Node::child_of(&root, &item(1, name));
        store.insert_node(&child).await.unwrap();
        (root, child)
    }

    #[tokio::test]
    async fn full_pipeline_sets_all_flags_and_rolls_up() {
        let store = test_store().await;
        let (root, child) = seed_child(&store, "Battery").await;
        let oracle = Arc::new(KeywordOracle::new(happy_routes()));

        let outcome = enrich_batch(
            store.clone(),
            oracle,
            &engine_config(),
            vec![child.id],
            &SilentProgress,
        )
        .await;

        assert_eq!(outcome.enriched, 1);
        assert_eq!(outcome.failed, 0);

        let enriched = store.get_node(child.id).await.unwrap().unwrap();
        assert!(enriched.flags.all_tracked());
        assert!(enriched.flags.enrichment_done);
        assert_eq!(enriched.supplier_name.as_deref(), Some("CellCo"));
        assert_eq!(enriched.mass, Some(50.0));
        assert!(!enriched.mass_estimated);
        assert_eq!(enriched.country_of_origin.as_deref(), Some("Japan"));
        assert!(enriched.origin_estimated);
        assert!(enriched.is_terminal);
        assert_eq!(enriched.estimated_emissions, 2.0);
        assert_eq!(enriched.transport_emissions, 0.5);
        assert_eq!(enriched.full_emissions, 2.5);
        // 50g of a 1kg parent
        assert_eq!(enriched.pct_of_parent_mass, Some(5.0));

        let parent = store.get_node(root.id).await.unwrap().unwrap();
        assert_eq!(parent.full_emissions, 2.5);
    }

    #[tokio::test]
    async fn unknown_supplier_marks_node_terminal() {
        let store = test_store().await;
        let (_, child) = seed_child(&store, "Mystery part").await;
        let mut routes = happy_routes();
        routes[0] = ("supplier of this component", Ok("*supplier: Unknown"));
        let oracle = Arc::new(KeywordOracle::new(routes));

        enrich_batch(
            store.clone(),
            oracle,
            &engine_config(),
            vec![child.id],
            &SilentProgress,
        )
        .await;

        let enriched = store.get_node(child.id).await.unwrap().unwrap();
        assert!(enriched.is_terminal);
        assert!(enriched.supplier_name.is_none());
        // no supplier: the address step is skipped but still flagged
        assert!(enriched.flags.address_done);
        assert!(enriched.country_of_origin.is_none());
    }

    #[tokio::test]
    async fn intangible_node_skips_mass_and_gets_zero_transport() {
        let store = test_store().await;
        let (_, child) = seed_child(&store, "Firmware").await;
        let mut routes = happy_routes();
        routes[1] = ("decomposition verdict", Ok("*verdict: software_or_service"));
        let oracle = Arc::new(KeywordOracle::new(routes));

        enrich_batch(
            store.clone(),
            oracle,
            &engine_config(),
            vec![child.id],
            &SilentProgress,
        )
        .await;

        let enriched = store.get_node(child.id).await.unwrap().unwrap();
        assert!(enriched.is_intangible);
        assert!(enriched.is_terminal);
        assert!(enriched.flags.mass_done);
        assert!(enriched.mass.is_none());
        assert_eq!(enriched.transport_emissions, 0.0);
        // intangibles still get a production estimate
        assert_eq!(enriched.estimated_emissions, 2.0);
    }

    #[tokio::test]
    async fn exact_mass_unknown_falls_back_to_estimate() {
        let store = test_store().await;
        let (_, child) = seed_child(&store, "Gasket").await;
        let mut routes = happy_routes();
        routes[2] = ("exact mass", Ok("*mass_value: Unknown"));
        routes.push((
            "Estimate the mass",
            Ok("*mass_value: 5\n*mass_unit: g\n*reasoning: typical gasket"),
        ));
        let oracle = Arc::new(KeywordOracle::new(routes));

        let outcome = enrich_batch(
            store.clone(),
            oracle,
            &engine_config(),
            vec![child.id],
            &SilentProgress,
        )
        .await;

        assert_eq!(outcome.fallbacks, 1);
        // exact lookup escalated before giving up
        assert!(outcome.escalations >= 1);

        let enriched = store.get_node(child.id).await.unwrap().unwrap();
        assert_eq!(enriched.mass, Some(5.0));
        assert!(enriched.mass_estimated);
        assert_eq!(enriched.mass_reasoning.as_deref(), Some("typical gasket"));
    }

    #[tokio::test]
    async fn completed_flags_make_pipeline_a_noop() {
        let store = test_store().await;
        let (_, child) = seed_child(&store, "Battery").await;
        for flag in ProgressFlag::tracked() {
            store.set_flag(child.id, flag).await.unwrap();
        }

        let oracle = Arc::new(KeywordOracle::new(vec![]));
        let outcome = enrich_batch(
            store.clone(),
            oracle.clone(),
            &engine_config(),
            vec![child.id],
            &SilentProgress,
        )
        .await;

        assert_eq!(outcome.enriched, 1);
        assert_eq!(oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn one_failing_node_does_not_block_siblings() {
        let store = test_store().await;
        let mut root = Node::root(TreeId::new(), "Laptop");
        root.mass = Some(1.0);
        root.mass_unit = Some(carbonbom_shared::MassUnit::Kg);
        store.insert_tree(&root).await.unwrap();

        let good = Node::child_of(&root, &item(1, "Battery"));
        let bad = Node::child_of(&root, &item(2, "Cursed part"));
        store
            .insert_children_batch(&[good.clone(), bad.clone()])
            .await
            .unwrap();

        let mut routes = happy_routes();
        // every oracle call about the cursed part fails outright
        routes.insert(0, ("Cursed part", Err("oracle offline")));
        let oracle = Arc::new(KeywordOracle::new(routes));

        let outcome = enrich_batch(
            store.clone(),
            oracle,
            &engine_config(),
            vec![good.id, bad.id],
            &SilentProgress,
        )
        .await;

        assert_eq!(outcome.enriched, 1);
        assert_eq!(outcome.failed, 1);

        let good_node = store.get_node(good.id).await.unwrap().unwrap();
        assert!(good_node.flags.all_tracked());
        // the degraded node still settles every flag so the tier can converge
        let bad_node = store.get_node(bad.id).await.unwrap().unwrap();
        assert!(bad_node.flags.all_tracked());
        assert!(bad_node.flags.enrichment_done);
        assert!(bad_node.is_terminal);
    }

    #[tokio::test]
    async fn escalation_is_recorded_in_telemetry() {
        let store = test_store().await;
        let (_, child) = seed_child(&store, "Battery").await;

        // primary answers garbage for the supplier question once; the
        // keyword router cannot distinguish models, so use a stateful oracle.
        struct FlakyOracle {
            inner: KeywordOracle,
            supplier_calls: Mutex<usize>,
        }

        #[async_trait]
        impl Oracle for FlakyOracle {
            async fn elicit(&self, request: ElicitRequest) -> Result<OracleReply> {
                let question = &request.messages.last().expect("non-empty").content;
                if question.contains("supplier of this component") {
                    let mut calls = self.supplier_calls.lock().expect("lock");
                    *calls += 1;
                    if *calls == 1 {
                        // malformed field line: strict parser rejects it
                        return Ok(OracleReply {
                            text: "*supplier CellCo".into(),
                            is_incomplete: false,
                        });
                    }
                }
                self.inner.elicit(request).await
            }
        }

        let oracle = Arc::new(FlakyOracle {
            inner: KeywordOracle::new(happy_routes()),
            supplier_calls: Mutex::new(0),
        });

        let outcome = enrich_batch(
            store.clone(),
            oracle,
            &engine_config(),
            vec![child.id],
            &SilentProgress,
        )
        .await;

        assert_eq!(outcome.escalations, 1);
        assert_eq!(store.count_escalations(child.id).await.unwrap(), 1);
        let enriched = store.get_node(child.id).await.unwrap().unwrap();
        assert_eq!(enriched.supplier_name.as_deref(), Some("CellCo"));
    }
}
