//! Core domain types for the CarbonBOM decomposition tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for node identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new time-sortable node identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A UUID v7 wrapper identifying one decomposition tree (one root product run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub Uuid);

impl TreeId {
    /// Generate a new time-sortable tree identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TreeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TreeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// MassUnit
// ---------------------------------------------------------------------------

/// Mass units accepted from oracle replies.
///
/// The gram-conversion table is deliberate policy, kept in one place so it
/// can be extended without touching the parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MassUnit {
    Mg,
    G,
    Kg,
    T,
    Lb,
    Oz,
}

impl MassUnit {
    /// Parse a unit token (case-insensitive, `lbs` accepted for `lb`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mg" => Some(Self::Mg),
            "g" => Some(Self::G),
            "kg" => Some(Self::Kg),
            "t" | "tonne" | "tonnes" => Some(Self::T),
            "lb" | "lbs" => Some(Self::Lb),
            "oz" => Some(Self::Oz),
            _ => None,
        }
    }

    /// Canonical token for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mg => "mg",
            Self::G => "g",
            Self::Kg => "kg",
            Self::T => "t",
            Self::Lb => "lb",
            Self::Oz => "oz",
        }
    }

    /// Convert a mass in this unit to grams.
    pub fn to_grams(&self, mass: f64) -> f64 {
        match self {
            Self::Mg => mass / 1000.0,
            Self::G => mass,
            Self::Kg => mass * 1000.0,
            Self::T => mass * 1_000_000.0,
            Self::Lb => mass * 453.592,
            Self::Oz => mass * 28.3495,
        }
    }
}

// ---------------------------------------------------------------------------
// Node status & progress flags
// ---------------------------------------------------------------------------

/// Explicit per-node workflow state, stored as a single column.
///
/// The boolean progress flags below remain the unit the convergence poller
/// counts; this enum is the authoritative state machine view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Created,
    Decomposed,
    Deduped,
    Enriching,
    Converged,
    Recursing,
    Terminal,
}

impl NodeStatus {
    /// Canonical token for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Decomposed => "decomposed",
            Self::Deduped => "deduped",
            Self::Enriching => "enriching",
            Self::Converged => "converged",
            Self::Recursing => "recursing",
            Self::Terminal => "terminal",
        }
    }

    /// Parse the storage token.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "decomposed" => Some(Self::Decomposed),
            "deduped" => Some(Self::Deduped),
            "enriching" => Some(Self::Enriching),
            "converged" => Some(Self::Converged),
            "recursing" => Some(Self::Recursing),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }
}

/// One enrichment sub-task's completion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressFlag {
    Supplier,
    Mass,
    Address,
    Transport,
    Emissions,
    Decomposition,
    Enrichment,
}

impl ProgressFlag {
    /// Column name in the node store.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Supplier => "supplier_done",
            Self::Mass => "mass_done",
            Self::Address => "address_done",
            Self::Transport => "transport_done",
            Self::Emissions => "emissions_done",
            Self::Decomposition => "decomposition_done",
            Self::Enrichment => "enrichment_done",
        }
    }

    /// The per-node flags the convergence poller counts across a tier.
    pub fn tracked() -> [ProgressFlag; 5] {
        [
            Self::Supplier,
            Self::Mass,
            Self::Address,
            Self::Transport,
            Self::Emissions,
        ]
    }
}

/// Per-node completion flags. Monotonic: once set, a flag is never cleared
/// except by an explicit reprocessing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressFlags {
    pub supplier_done: bool,
    pub mass_done: bool,
    pub address_done: bool,
    pub transport_done: bool,
    pub emissions_done: bool,
    pub decomposition_done: bool,
    pub enrichment_done: bool,
}

impl ProgressFlags {
    /// Read a single flag.
    pub fn get(&self, flag: ProgressFlag) -> bool {
        match flag {
            ProgressFlag::Supplier => self.supplier_done,
            ProgressFlag::Mass => self.mass_done,
            ProgressFlag::Address => self.address_done,
            ProgressFlag::Transport => self.transport_done,
            ProgressFlag::Emissions => self.emissions_done,
            ProgressFlag::Decomposition => self.decomposition_done,
            ProgressFlag::Enrichment => self.enrichment_done,
        }
    }

    /// Set a single flag (monotonic).
    pub fn set(&mut self, flag: ProgressFlag) {
        match flag {
            ProgressFlag::Supplier => self.supplier_done = true,
            ProgressFlag::Mass => self.mass_done = true,
            ProgressFlag::Address => self.address_done = true,
            ProgressFlag::Transport => self.transport_done = true,
            ProgressFlag::Emissions => self.emissions_done = true,
            ProgressFlag::Decomposition => self.decomposition_done = true,
            ProgressFlag::Enrichment => self.enrichment_done = true,
        }
    }

    /// True when every tracked enrichment flag is set.
    pub fn all_tracked(&self) -> bool {
        ProgressFlag::tracked().iter().all(|f| self.get(*f))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One product or material in the decomposition tree — the unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier (UUID v7; creation-ordered).
    pub id: NodeId,
    /// Owning decomposition tree.
    pub tree_id: TreeId,
    /// Material or product name.
    pub name: String,
    /// Depth in the tree (0 = root product).
    pub tier: u32,
    /// Parent node; `None` only for the tier-0 root.
    pub parent_id: Option<NodeId>,
    /// Denormalized ancestry string, immutable once set. Used verbatim as
    /// oracle context; never recomputed when an ancestor changes.
    pub chain_summary: String,
    /// Free-text description from elicitation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // Physical attributes, filled by enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass_unit: Option<MassUnit>,
    /// True when the mass came from the estimation fallback.
    #[serde(default)]
    pub mass_estimated: bool,
    /// Justification text required by the estimation fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass_reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_name: Option<String>,
    /// Suppliers merged off dedup losers (set union, no duplicates).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_suppliers: Vec<String>,
    /// Preferred over `country_of_origin` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_of_origin: Option<String>,
    /// True when the origin was inferred rather than sourced.
    #[serde(default)]
    pub origin_estimated: bool,

    // Classification.
    /// No further decomposition below this node.
    #[serde(default)]
    pub is_terminal: bool,
    /// Software/service component — exempt from mass/transport enrichment.
    #[serde(default)]
    pub is_intangible: bool,

    /// Workflow state machine position.
    pub status: NodeStatus,
    /// Derived/legacy completion-flag view; the poller counts these.
    #[serde(default)]
    pub flags: ProgressFlags,

    // Derived metrics (kgCO2e).
    /// Own production contribution.
    #[serde(default)]
    pub estimated_emissions: f64,
    /// Transport leg contribution. Zero for intangible nodes.
    #[serde(default)]
    pub transport_emissions: f64,
    /// Own + descendants; maintained exclusively by atomic increments.
    #[serde(default)]
    pub full_emissions: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pct_of_parent_mass: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pct_of_parent_emissions: Option<f64>,

    /// Creation time — the dedup sort key.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a tier-0 root product node.
    pub fn root(tree_id: TreeId, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            tree_id,
            chain_summary: name.clone(),
            name,
            tier: 0,
            parent_id: None,
            description: None,
            mass: None,
            mass_unit: None,
            mass_estimated: false,
            mass_reasoning: None,
            supplier_name: None,
            alt_suppliers: Vec::new(),
            supplier_address: None,
            country_of_origin: None,
            origin_estimated: false,
            is_terminal: false,
            is_intangible: false,
            status: NodeStatus::Created,
            flags: ProgressFlags::default(),
            estimated_emissions: 0.0,
            transport_emissions: 0.0,
            full_emissions: 0.0,
            pct_of_parent_mass: None,
            pct_of_parent_emissions: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a child node under `parent` from one elicited BOM line.
    ///
    /// The chain summary concatenates the parent chain, parent context
    /// (supplier, address-or-origin, mass), and the item name.
    pub fn child_of(parent: &Node, item: &BomItem) -> Self {
        let mut node = Self::root(parent.tree_id, item.name.clone());
        node.tier = parent.tier + 1;
        node.parent_id = Some(parent.id);
        node.chain_summary = chain_summary_for_child(parent, &item.name);
        node.description = item.description.clone();
        node.supplier_name = item.supplier.clone();
        node.mass = item.mass;
        node.mass_unit = item.unit;
        // A supplier elicited alongside the BOM line counts as resolved.
        node.flags.supplier_done = node.supplier_name.is_some();
        node
    }

    /// Mass in grams, when both value and unit are known.
    pub fn mass_grams(&self) -> Option<f64> {
        match (self.mass, self.mass_unit) {
            (Some(m), Some(u)) => Some(u.to_grams(m)),
            _ => None,
        }
    }
}

/// Build the denormalized ancestry string for a new child.
pub fn chain_summary_for_child(parent: &Node, child_name: &str) -> String {
    let mut context = Vec::new();
    if let Some(supplier) = &parent.supplier_name {
        context.push(format!("[Supplier: {supplier}]"));
    }
    if let Some(address) = &parent.supplier_address {
        context.push(format!("[Supplier Address: {address}]"));
    } else if let Some(origin) = &parent.country_of_origin {
        if parent.origin_estimated {
            context.push(format!("[Estimated Country of Origin: {origin}]"));
        } else {
            context.push(format!("[Country of Origin: {origin}]"));
        }
    }
    if let (Some(mass), Some(unit)) = (parent.mass, parent.mass_unit) {
        context.push(format!("[Mass: {mass}{}]", unit.as_str()));
    }

    if context.is_empty() {
        format!("{} -> {}", parent.chain_summary, child_name)
    } else {
        format!(
            "{} {} -> {}",
            parent.chain_summary,
            context.join(" "),
            child_name
        )
    }
}

// ---------------------------------------------------------------------------
// BomItem & Verdict
// ---------------------------------------------------------------------------

/// One elicited bill-of-materials line, addressed by the index the oracle
/// assigned. Indices are never renumbered so the verification pass can
/// target items deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomItem {
    pub index: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<MassUnit>,
}

/// Terminal-classification verdict for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep decomposing.
    Continue,
    /// No further decomposition.
    Terminal,
    /// Software/service — terminal and exempt from physical enrichment.
    Intangible,
}
