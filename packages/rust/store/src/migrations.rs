//! SQL migration definitions for the CarbonBOM database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: trees, nodes, model_escalations",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One decomposition run per root product
CREATE TABLE IF NOT EXISTS trees (
    id           TEXT PRIMARY KEY,
    root_node_id TEXT NOT NULL,
    product_name TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- Decomposition tree nodes
CREATE TABLE IF NOT EXISTS nodes (
    id                      TEXT PRIMARY KEY,
    tree_id                 TEXT NOT NULL REFERENCES trees(id) ON DELETE CASCADE,
    name                    TEXT NOT NULL,
    tier                    INTEGER NOT NULL,
    parent_id               TEXT REFERENCES nodes(id) ON DELETE CASCADE,
    chain_summary           TEXT NOT NULL,
    description             TEXT,

    mass                    REAL,
    mass_unit               TEXT,
    mass_estimated          INTEGER NOT NULL DEFAULT 0,
    mass_reasoning          TEXT,
    supplier_name           TEXT,
    alt_suppliers_json      TEXT NOT NULL DEFAULT '[]',
    supplier_address        TEXT,
    country_of_origin       TEXT,
    origin_estimated        INTEGER NOT NULL DEFAULT 0,

    is_terminal             INTEGER NOT NULL DEFAULT 0,
    is_intangible           INTEGER NOT NULL DEFAULT 0,

    status                  TEXT NOT NULL DEFAULT 'created',
    supplier_done           INTEGER NOT NULL DEFAULT 0,
    mass_done               INTEGER NOT NULL DEFAULT 0,
    address_done            INTEGER NOT NULL DEFAULT 0,
    transport_done          INTEGER NOT NULL DEFAULT 0,
    emissions_done          INTEGER NOT NULL DEFAULT 0,
    decomposition_done      INTEGER NOT NULL DEFAULT 0,
    enrichment_done         INTEGER NOT NULL DEFAULT 0,

    estimated_emissions     REAL NOT NULL DEFAULT 0,
    transport_emissions     REAL NOT NULL DEFAULT 0,
    full_emissions          REAL NOT NULL DEFAULT 0,
    pct_of_parent_mass      REAL,
    pct_of_parent_emissions REAL,

    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_tree ON nodes(tree_id);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_nodes_tree_tier ON nodes(tree_id, tier);

-- Model escalation telemetry
CREATE TABLE IF NOT EXISTS model_escalations (
    id                TEXT PRIMARY KEY,
    node_id           TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    task              TEXT NOT NULL,
    primary_model     TEXT NOT NULL,
    secondary_model   TEXT NOT NULL,
    escalation_worked INTEGER NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_escalations_node ON model_escalations(node_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
