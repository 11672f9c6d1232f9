//! Turso Embedded / libSQL node store (offline mode).
//!
//! The [`NodeStore`] struct wraps a libSQL database holding decomposition
//! trees, their nodes with per-task progress flags, and model escalation
//! telemetry.
//!
//! **Access rules:**
//! - Engine and CLI: read-write (sole writer) via [`NodeStore::open`]
//! - Reporting tools: read-only via [`NodeStore::open_readonly`]

mod migrations;

use std::path::Path;

use carbonbom_shared::{
    CarbonBomError, MassUnit, Node, NodeId, NodeStatus, ProgressFlag, ProgressFlags, Result,
    TreeId, Verdict,
};
use chrono::Utc;
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Column list shared by every `SELECT` that maps to a full [`Node`].
const NODE_COLUMNS: &str = "id, tree_id, name, tier, parent_id, chain_summary, description, \
     mass, mass_unit, mass_estimated, mass_reasoning, \
     supplier_name, alt_suppliers_json, supplier_address, country_of_origin, origin_estimated, \
     is_terminal, is_intangible, status, \
     supplier_done, mass_done, address_done, transport_done, emissions_done, \
     decomposition_done, enrichment_done, \
     estimated_emissions, transport_emissions, full_emissions, \
     pct_of_parent_mass, pct_of_parent_emissions, \
     created_at, updated_at";

/// Primary store handle wrapping a libSQL database.
pub struct NodeStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl NodeStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CarbonBomError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let store = Self {
            db,
            conn,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open a database at `path` in read-only mode (for reporting tools).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    CarbonBomError::Store(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CarbonBomError::Store(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tree operations
    // -----------------------------------------------------------------------

    /// Insert a new tree record together with its tier-0 root node.
    pub async fn insert_tree(&self, root: &Node) -> Result<()> {
        self.check_writable()?;
        if root.tier != 0 || root.parent_id.is_some() {
            return Err(CarbonBomError::validation(
                "tree root must be a tier-0 node with no parent",
            ));
        }
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO trees (id, root_node_id, product_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    root.tree_id.to_string(),
                    root.id.to_string(),
                    root.name.as_str(),
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        self.insert_node(root).await
    }

    /// Get a tree by ID. Returns `(root_node_id, product_name, created_at)`.
    pub async fn get_tree(&self, tree_id: TreeId) -> Result<Option<(NodeId, String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT root_node_id, product_name, created_at FROM trees WHERE id = ?1",
                params![tree_id.to_string()],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let root: String = row
                    .get(0)
                    .map_err(|e| CarbonBomError::Store(e.to_string()))?;
                let root = root
                    .parse::<NodeId>()
                    .map_err(|e| CarbonBomError::Store(format!("invalid root node id: {e}")))?;
                Ok(Some((
                    root,
                    row.get::<String>(1)
                        .map_err(|e| CarbonBomError::Store(e.to_string()))?,
                    row.get::<String>(2)
                        .map_err(|e| CarbonBomError::Store(e.to_string()))?,
                )))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(CarbonBomError::Store(e.to_string())),
        }
    }

    /// List all trees. Returns `Vec<(tree_id, product_name, created_at)>`.
    pub async fn list_trees(&self) -> Result<Vec<(TreeId, String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, product_name, created_at FROM trees ORDER BY created_at",
                params![],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| CarbonBomError::Store(e.to_string()))?;
            let id = id
                .parse::<TreeId>()
                .map_err(|e| CarbonBomError::Store(format!("invalid tree id: {e}")))?;
            results.push((
                id,
                row.get::<String>(1)
                    .map_err(|e| CarbonBomError::Store(e.to_string()))?,
                row.get::<String>(2)
                    .map_err(|e| CarbonBomError::Store(e.to_string()))?,
            ));
        }
        Ok(results)
    }

    /// Node count per tier for a tree, ascending by tier.
    pub async fn tier_counts(&self, tree_id: TreeId) -> Result<Vec<(u32, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT tier, COUNT(*) FROM nodes WHERE tree_id = ?1 GROUP BY tier ORDER BY tier",
                params![tree_id.to_string()],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let tier: i64 = row
                .get(0)
                .map_err(|e| CarbonBomError::Store(e.to_string()))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| CarbonBomError::Store(e.to_string()))?;
            results.push((tier as u32, count as u64));
        }
        Ok(results)
    }

    /// Nodes of a tree still mid-workflow: anything not yet converged or
    /// terminal. Zero means every detached expansion has settled.
    pub async fn count_unsettled(&self, tree_id: TreeId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM nodes \
                 WHERE tree_id = ?1 AND status NOT IN ('converged', 'terminal')",
                params![tree_id.to_string()],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| CarbonBomError::Store(e.to_string()))?;
                Ok(n as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(CarbonBomError::Store(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Node insertion & retrieval
    // -----------------------------------------------------------------------

    /// Insert a single node.
    pub async fn insert_node(&self, node: &Node) -> Result<()> {
        self.check_writable()?;
        Self::insert_node_on(&self.conn, node).await
    }

    /// Insert a batch of sibling nodes in one transaction. Either all land
    /// or none do.
    pub async fn insert_children_batch(&self, nodes: &[Node]) -> Result<()> {
        self.check_writable()?;
        if nodes.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        for node in nodes {
            Self::insert_node_on(&tx, node).await?;
        }
        tx.commit()
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))
    }

    async fn insert_node_on(conn: &Connection, node: &Node) -> Result<()> {
        let alt_json = serde_json::to_string(&node.alt_suppliers)
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        conn.execute(
            &format!(
                "INSERT INTO nodes ({NODE_COLUMNS}) VALUES (
                 ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33)"
            ),
            params![
                node.id.to_string(),
                node.tree_id.to_string(),
                node.name.as_str(),
                i64::from(node.tier),
                node.parent_id.map(|p| p.to_string()),
                node.chain_summary.as_str(),
                node.description.as_deref(),
                node.mass,
                node.mass_unit.map(|u| u.as_str()),
                i64::from(node.mass_estimated),
                node.mass_reasoning.as_deref(),
                node.supplier_name.as_deref(),
                alt_json.as_str(),
                node.supplier_address.as_deref(),
                node.country_of_origin.as_deref(),
                i64::from(node.origin_estimated),
                i64::from(node.is_terminal),
                i64::from(node.is_intangible),
                node.status.as_str(),
                i64::from(node.flags.supplier_done),
                i64::from(node.flags.mass_done),
                i64::from(node.flags.address_done),
                i64::from(node.flags.transport_done),
                i64::from(node.flags.emissions_done),
                i64::from(node.flags.decomposition_done),
                i64::from(node.flags.enrichment_done),
                node.estimated_emissions,
                node.transport_emissions,
                node.full_emissions,
                node.pct_of_parent_mass,
                node.pct_of_parent_emissions,
                node.created_at.to_rfc3339(),
                node.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        Ok(())
    }

    /// Get a node by ID.
    pub async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_node(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CarbonBomError::Store(e.to_string())),
        }
    }

    /// All direct children of a node, ordered by creation time ascending.
    pub async fn children_of(&self, parent: NodeId) -> Result<Vec<Node>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ?1 ORDER BY created_at, id"
                ),
                params![parent.to_string()],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_node(&row)?);
        }
        Ok(results)
    }

    /// All nodes of a tree at a given tier, ordered by creation time ascending.
    pub async fn nodes_at_tier(&self, tree_id: TreeId, tier: u32) -> Result<Vec<Node>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM nodes
                     WHERE tree_id = ?1 AND tier = ?2 ORDER BY created_at, id"
                ),
                params![tree_id.to_string(), i64::from(tier)],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_node(&row)?);
        }
        Ok(results)
    }

    /// Number of direct children of a node.
    pub async fn count_children(&self, parent: NodeId) -> Result<u64> {
        self.count_query(
            "SELECT COUNT(*) FROM nodes WHERE parent_id = ?1".into(),
            parent,
        )
        .await
    }

    /// Number of direct children with a given progress flag set.
    pub async fn count_children_with_flag(
        &self,
        parent: NodeId,
        flag: ProgressFlag,
    ) -> Result<u64> {
        // flag.column() is a static identifier, safe to splice into SQL
        self.count_query(
            format!(
                "SELECT COUNT(*) FROM nodes WHERE parent_id = ?1 AND {} = 1",
                flag.column()
            ),
            parent,
        )
        .await
    }

    async fn count_query(&self, sql: String, parent: NodeId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(&sql, params![parent.to_string()])
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| CarbonBomError::Store(e.to_string()))?;
                Ok(n as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(CarbonBomError::Store(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Status & progress flags
    // -----------------------------------------------------------------------

    /// Set the workflow status of a node.
    pub async fn set_status(&self, id: NodeId, status: NodeStatus) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    /// Set one progress flag (monotonic; setting an already-set flag is a no-op).
    pub async fn set_flag(&self, id: NodeId, flag: ProgressFlag) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            &format!(
                "UPDATE nodes SET {} = 1, updated_at = ?1 WHERE id = ?2",
                flag.column()
            ),
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    /// Clear every progress flag on a node so it can be reprocessed.
    /// This is the only path that unsets flags.
    pub async fn clear_flags(&self, id: NodeId) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET supplier_done = 0, mass_done = 0, address_done = 0,
                 transport_done = 0, emissions_done = 0, decomposition_done = 0,
                 enrichment_done = 0, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Enrichment field updates
    // -----------------------------------------------------------------------

    /// Record a resolved mass.
    pub async fn update_mass(
        &self,
        id: NodeId,
        mass: f64,
        unit: MassUnit,
        estimated: bool,
        reasoning: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET mass = ?1, mass_unit = ?2, mass_estimated = ?3,
                 mass_reasoning = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                mass,
                unit.as_str(),
                i64::from(estimated),
                reasoning,
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )
        .await
    }

    /// Record a resolved supplier name.
    pub async fn update_supplier(&self, id: NodeId, supplier: &str) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET supplier_name = ?1, updated_at = ?2 WHERE id = ?3",
            params![supplier, Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    /// Record supplier address and/or country of origin.
    pub async fn update_address(
        &self,
        id: NodeId,
        address: Option<&str>,
        origin: Option<&str>,
        origin_estimated: bool,
    ) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET supplier_address = COALESCE(?1, supplier_address),
                 country_of_origin = COALESCE(?2, country_of_origin),
                 origin_estimated = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                address,
                origin,
                i64::from(origin_estimated),
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )
        .await
    }

    /// Apply a terminal-classification verdict.
    pub async fn apply_verdict(&self, id: NodeId, verdict: Verdict) -> Result<()> {
        self.check_writable()?;
        let (terminal, intangible) = match verdict {
            Verdict::Continue => (false, false),
            Verdict::Terminal => (true, false),
            Verdict::Intangible => (true, true),
        };
        self.touch_update(
            "UPDATE nodes SET is_terminal = ?1, is_intangible = ?2, updated_at = ?3
             WHERE id = ?4",
            params![
                i64::from(terminal),
                i64::from(intangible),
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )
        .await
    }

    /// Record a node's own emissions estimate (kgCO2e).
    pub async fn update_estimated_emissions(&self, id: NodeId, value: f64) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET estimated_emissions = ?1, updated_at = ?2 WHERE id = ?3",
            params![value, Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    /// Record a node's transport-leg emissions (kgCO2e).
    pub async fn update_transport_emissions(&self, id: NodeId, value: f64) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET transport_emissions = ?1, updated_at = ?2 WHERE id = ?3",
            params![value, Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    /// Record percentage-of-parent derivations.
    pub async fn update_percentages(
        &self,
        id: NodeId,
        pct_mass: Option<f64>,
        pct_emissions: Option<f64>,
    ) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET pct_of_parent_mass = COALESCE(?1, pct_of_parent_mass),
                 pct_of_parent_emissions = COALESCE(?2, pct_of_parent_emissions),
                 updated_at = ?3
             WHERE id = ?4",
            params![
                pct_mass,
                pct_emissions,
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )
        .await
    }

    /// Atomically add `delta` to a node's rolled-up emissions total.
    /// Read-modify-write in the database, never in application memory, so
    /// concurrent descendants cannot lose increments.
    pub async fn increment_emissions(&self, id: NodeId, delta: f64) -> Result<()> {
        self.check_writable()?;
        self.touch_update(
            "UPDATE nodes SET full_emissions = full_emissions + ?1, updated_at = ?2
             WHERE id = ?3",
            params![delta, Utc::now().to_rfc3339(), id.to_string()],
        )
        .await
    }

    async fn touch_update(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<()> {
        self.conn
            .execute(sql, params)
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dedup merge
    // -----------------------------------------------------------------------

    /// Merge dedup losers into a keeper and delete them, in one transaction.
    ///
    /// The losers' supplier names and alternative-supplier lists are
    /// set-unioned into the keeper's `alt_suppliers` (the keeper's own
    /// supplier is excluded). Partial merges never persist.
    pub async fn merge_and_delete(&self, keeper: NodeId, losers: &[NodeId]) -> Result<()> {
        self.check_writable()?;
        if losers.is_empty() {
            return Ok(());
        }

        let keeper_node = self
            .get_node(keeper)
            .await?
            .ok_or_else(|| CarbonBomError::validation(format!("keeper node {keeper} not found")))?;

        let mut alts: Vec<String> = keeper_node.alt_suppliers.clone();
        for loser_id in losers {
            let Some(loser) = self.get_node(*loser_id).await? else {
                continue;
            };
            let mut candidates = loser.alt_suppliers;
            if let Some(name) = loser.supplier_name {
                candidates.push(name);
            }
            for candidate in candidates {
                let is_own = keeper_node.supplier_name.as_deref() == Some(candidate.as_str());
                if !is_own && !alts.contains(&candidate) {
                    alts.push(candidate);
                }
            }
        }

        let alt_json =
            serde_json::to_string(&alts).map_err(|e| CarbonBomError::Store(e.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        tx.execute(
            "UPDATE nodes SET alt_suppliers_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                alt_json.as_str(),
                Utc::now().to_rfc3339(),
                keeper.to_string()
            ],
        )
        .await
        .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        for loser_id in losers {
            tx.execute(
                "DELETE FROM nodes WHERE id = ?1",
                params![loser_id.to_string()],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Escalation telemetry
    // -----------------------------------------------------------------------

    /// Record one model-escalation event for later analysis.
    pub async fn record_escalation(
        &self,
        node_id: NodeId,
        task: &str,
        primary_model: &str,
        secondary_model: &str,
        escalation_worked: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO model_escalations
                     (id, node_id, task, primary_model, secondary_model, escalation_worked, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    node_id.to_string(),
                    task,
                    primary_model,
                    secondary_model,
                    i64::from(escalation_worked),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| CarbonBomError::Store(e.to_string()))?;
        Ok(())
    }

    /// Count recorded escalations for a node.
    pub async fn count_escalations(&self, node_id: NodeId) -> Result<u64> {
        self.count_query(
            "SELECT COUNT(*) FROM model_escalations WHERE node_id = ?1".into(),
            node_id,
        )
        .await
    }
}

/// Convert a database row to a [`Node`].
fn row_to_node(row: &libsql::Row) -> Result<Node> {
    fn get_str(row: &libsql::Row, idx: i32) -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| CarbonBomError::Store(e.to_string()))
    }
    fn get_bool(row: &libsql::Row, idx: i32) -> Result<bool> {
        Ok(row
            .get::<i64>(idx)
            .map_err(|e| CarbonBomError::Store(e.to_string()))?
            != 0)
    }
    fn get_time(row: &libsql::Row, idx: i32) -> Result<chrono::DateTime<chrono::Utc>> {
        let s = get_str(row, idx)?;
        chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| CarbonBomError::Store(format!("invalid date: {e}")))
    }

    let status_token = get_str(row, 18)?;
    let status = NodeStatus::parse(&status_token)
        .ok_or_else(|| CarbonBomError::Store(format!("unknown node status: {status_token}")))?;

    let alt_json = get_str(row, 12)?;
    let alt_suppliers: Vec<String> = serde_json::from_str(&alt_json)
        .map_err(|e| CarbonBomError::Store(format!("invalid alt_suppliers: {e}")))?;

    Ok(Node {
        id: get_str(row, 0)?
            .parse()
            .map_err(|e| CarbonBomError::Store(format!("invalid node id: {e}")))?,
        tree_id: get_str(row, 1)?
            .parse()
            .map_err(|e| CarbonBomError::Store(format!("invalid tree id: {e}")))?,
        name: get_str(row, 2)?,
        tier: row
            .get::<i64>(3)
            .map_err(|e| CarbonBomError::Store(e.to_string()))? as u32,
        parent_id: match row.get::<String>(4) {
            Ok(s) => Some(
                s.parse()
                    .map_err(|e| CarbonBomError::Store(format!("invalid parent id: {e}")))?,
            ),
            Err(_) => None,
        },
        chain_summary: get_str(row, 5)?,
        description: row.get::<String>(6).ok(),
        mass: row.get::<f64>(7).ok(),
        mass_unit: row.get::<String>(8).ok().and_then(|s| MassUnit::parse(&s)),
        mass_estimated: get_bool(row, 9)?,
        mass_reasoning: row.get::<String>(10).ok(),
        supplier_name: row.get::<String>(11).ok(),
        alt_suppliers,
        supplier_address: row.get::<String>(13).ok(),
        country_of_origin: row.get::<String>(14).ok(),
        origin_estimated: get_bool(row, 15)?,
        is_terminal: get_bool(row, 16)?,
        is_intangible: get_bool(row, 17)?,
        status,
        flags: ProgressFlags {
            supplier_done: get_bool(row, 19)?,
            mass_done: get_bool(row, 20)?,
            address_done: get_bool(row, 21)?,
            transport_done: get_bool(row, 22)?,
            emissions_done: get_bool(row, 23)?,
            decomposition_done: get_bool(row, 24)?,
            enrichment_done: get_bool(row, 25)?,
        },
        estimated_emissions: row.get::<f64>(26).unwrap_or(0.0),
        transport_emissions: row.get::<f64>(27).unwrap_or(0.0),
        full_emissions: row.get::<f64>(28).unwrap_or(0.0),
        pct_of_parent_mass: row.get::<f64>(29).ok(),
        pct_of_parent_emissions: row.get::<f64>(30).ok(),
        created_at: get_time(row, 31)?,
        updated_at: get_time(row, 32)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbonbom_shared::BomItem;

    /// Create a temp file store for testing.
    async fn test_store() -> NodeStore {
        let tmp = std::env::temp_dir().join(format!("cbom_test_{}.db", Uuid::now_v7()));
        NodeStore::open(&tmp).await.expect("open test db")
    }

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

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        let version = store.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cbom_test_{}.db", Uuid::now_v7()));
        let _s1 = NodeStore::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = NodeStore::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn tree_and_root_roundtrip() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");

        store.insert_tree(&root).await.expect("insert tree");

        let tree = store.get_tree(root.tree_id).await.expect("get tree");
        let (root_id, name, _) = tree.expect("tree exists");
        assert_eq!(root_id, root.id);
        assert_eq!(name, "Laptop");

        let fetched = store
            .get_node(root.id)
            .await
            .expect("get node")
            .expect("node exists");
        assert_eq!(fetched.name, "Laptop");
        assert_eq!(fetched.tier, 0);
        assert_eq!(fetched.status, NodeStatus::Created);
        assert!(fetched.parent_id.is_none());
    }

    #[tokio::test]
    async fn insert_tree_rejects_non_root() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        let child = Node::child_of(&root, &item(1, "Battery", None));
        assert!(store.insert_tree(&child).await.is_err());
    }

    #[tokio::test]
    async fn children_batch_and_queries() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();

        let children: Vec<Node> = ["Battery", "Screen", "Chassis"]
            .iter()
            .enumerate()
            .map(|(i, name)| Node::child_of(&root, &item(i as u32 + 1, name, None)))
            .collect();
        store
            .insert_children_batch(&children)
            .await
            .expect("batch insert");

        assert_eq!(store.count_children(root.id).await.unwrap(), 3);

        let fetched = store.children_of(root.id).await.unwrap();
        assert_eq!(fetched.len(), 3);
        // creation order preserved
        assert_eq!(fetched[0].name, "Battery");

        let tier1 = store.nodes_at_tier(root.tree_id, 1).await.unwrap();
        assert_eq!(tier1.len(), 3);

        let counts = store.tier_counts(root.tree_id).await.unwrap();
        assert_eq!(counts, vec![(0, 1), (1, 3)]);
    }

    #[tokio::test]
    async fn flags_and_status() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();
        let child = Node::child_of(&root, &item(1, "Battery", None));
        store.insert_node(&child).await.unwrap();

        assert_eq!(
            store
                .count_children_with_flag(root.id, ProgressFlag::Mass)
                .await
                .unwrap(),
            0
        );

        store.set_flag(child.id, ProgressFlag::Mass).await.unwrap();
        // setting twice is harmless
        store.set_flag(child.id, ProgressFlag::Mass).await.unwrap();
        assert_eq!(
            store
                .count_children_with_flag(root.id, ProgressFlag::Mass)
                .await
                .unwrap(),
            1
        );

        store
            .set_status(child.id, NodeStatus::Enriching)
            .await
            .unwrap();
        let fetched = store.get_node(child.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NodeStatus::Enriching);
        assert!(fetched.flags.mass_done);

        store.clear_flags(child.id).await.unwrap();
        let fetched = store.get_node(child.id).await.unwrap().unwrap();
        assert!(!fetched.flags.mass_done);
    }

    #[tokio::test]
    async fn enrichment_field_updates() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();
        let child = Node::child_of(&root, &item(1, "Battery", None));
        store.insert_node(&child).await.unwrap();

        store
            .update_mass(child.id, 55.0, MassUnit::G, true, Some("typical cell mass"))
            .await
            .unwrap();
        store.update_supplier(child.id, "CellCo").await.unwrap();
        store
            .update_address(child.id, None, Some("South Korea"), true)
            .await
            .unwrap();
        store.apply_verdict(child.id, Verdict::Terminal).await.unwrap();
        store
            .update_estimated_emissions(child.id, 1.25)
            .await
            .unwrap();
        store
            .update_transport_emissions(child.id, 0.4)
            .await
            .unwrap();
        store
            .update_percentages(child.id, Some(4.5), None)
            .await
            .unwrap();

        let fetched = store.get_node(child.id).await.unwrap().unwrap();
        assert_eq!(fetched.mass, Some(55.0));
        assert_eq!(fetched.mass_unit, Some(MassUnit::G));
        assert!(fetched.mass_estimated);
        assert_eq!(fetched.supplier_name.as_deref(), Some("CellCo"));
        assert_eq!(fetched.country_of_origin.as_deref(), Some("South Korea"));
        assert!(fetched.origin_estimated);
        assert!(fetched.is_terminal);
        assert!(!fetched.is_intangible);
        assert_eq!(fetched.estimated_emissions, 1.25);
        assert_eq!(fetched.transport_emissions, 0.4);
        assert_eq!(fetched.pct_of_parent_mass, Some(4.5));
    }

    #[tokio::test]
    async fn increment_emissions_accumulates() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();

        store.increment_emissions(root.id, 1.5).await.unwrap();
        store.increment_emissions(root.id, 2.25).await.unwrap();

        let fetched = store.get_node(root.id).await.unwrap().unwrap();
        assert_eq!(fetched.full_emissions, 3.75);
    }

    #[tokio::test]
    async fn merge_unions_suppliers_and_deletes_losers() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();

        let keeper = Node::child_of(&root, &item(1, "Screw", Some("Acme")));
        let mut loser1 = Node::child_of(&root, &item(2, "screw", Some("BoltCo")));
        loser1.alt_suppliers = vec!["FastenerWorld".into()];
        // duplicate of the keeper's own supplier must not re-appear
        let loser2 = Node::child_of(&root, &item(3, "SCREW ", Some("Acme")));

        store.insert_node(&keeper).await.unwrap();
        store.insert_node(&loser1).await.unwrap();
        store.insert_node(&loser2).await.unwrap();

        store
            .merge_and_delete(keeper.id, &[loser1.id, loser2.id])
            .await
            .expect("merge");

        let merged = store.get_node(keeper.id).await.unwrap().unwrap();
        assert_eq!(merged.alt_suppliers, vec!["FastenerWorld", "BoltCo"]);
        assert!(store.get_node(loser1.id).await.unwrap().is_none());
        assert!(store.get_node(loser2.id).await.unwrap().is_none());
        assert_eq!(store.count_children(root.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn escalation_telemetry() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();

        store
            .record_escalation(root.id, "mass_exact", "model-a", "model-b", true)
            .await
            .expect("record escalation");

        assert_eq!(store.count_escalations(root.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cbom_test_{}.db", Uuid::now_v7()));
        let rw = NodeStore::open(&tmp).await.unwrap();
        let root = Node::root(TreeId::new(), "Laptop");
        rw.insert_tree(&root).await.unwrap();
        drop(rw);

        let ro = NodeStore::open_readonly(&tmp).await.unwrap();
        let another = Node::root(TreeId::new(), "Phone");
        let result = ro.insert_tree(&another).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn unsettled_count_tracks_statuses() {
        let store = test_store().await;
        let root = Node::root(TreeId::new(), "Laptop");
        store.insert_tree(&root).await.unwrap();
        let child = Node::child_of(&root, &item(1, "Battery", None));
        store.insert_node(&child).await.unwrap();

        assert_eq!(store.count_unsettled(root.tree_id).await.unwrap(), 2);

        store
            .set_status(root.id, NodeStatus::Converged)
            .await
            .unwrap();
        assert_eq!(store.count_unsettled(root.tree_id).await.unwrap(), 1);

        store
            .set_status(child.id, NodeStatus::Terminal)
            .await
            .unwrap();
        assert_eq!(store.count_unsettled(root.tree_id).await.unwrap(), 0);
    }
}
