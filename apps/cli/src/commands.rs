//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use carbonbom_engine::{Engine, EngineProgress};
use carbonbom_oracle::HttpOracle;
use carbonbom_shared::{
    AppConfig, EngineConfig, MassUnit, NodeId, TreeId, init_config, load_config, validate_api_key,
};
use carbonbom_store::NodeStore;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CarbonBOM — tiered product carbon-footprint decomposition.
#[derive(Parser)]
#[command(
    name = "carbonbom",
    version,
    about = "Decompose products into carbon bills of materials with per-component emissions.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Decompose a product and attribute emissions across its tree.
    Decompose {
        /// Product name to decompose.
        name: String,

        /// Total product mass, paired with --unit.
        #[arg(long)]
        mass: Option<f64>,

        /// Mass unit: mg, g, kg, t, lb, or oz.
        #[arg(long)]
        unit: Option<String>,

        /// Known manufacturer of the product.
        #[arg(long)]
        supplier: Option<String>,

        /// Maximum decomposition depth (overrides config).
        #[arg(long)]
        depth: Option<u32>,

        /// Database file (overrides config).
        #[arg(long)]
        db: Option<String>,
    },

    /// Show progress and emission totals for a decomposition tree.
    Status {
        /// Tree ID as printed by decompose.
        tree_id: String,

        /// Database file (overrides config).
        #[arg(long)]
        db: Option<String>,
    },

    /// List all decomposition trees.
    List {
        /// Database file (overrides config).
        #[arg(long)]
        db: Option<String>,
    },

    /// Clear a component's progress flags and re-run its enrichment.
    Reprocess {
        /// Node ID of the component to reprocess.
        node_id: String,

        /// Database file (overrides config).
        #[arg(long)]
        db: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "carbonbom=info",
        1 => "carbonbom=debug",
        _ => "carbonbom=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Decompose {
            name,
            mass,
            unit,
            supplier,
            depth,
            db,
        } => cmd_decompose(&name, mass, unit.as_deref(), supplier, depth, db.as_deref()).await,
        Command::Status { tree_id, db } => cmd_status(&tree_id, db.as_deref()).await,
        Command::List { db } => cmd_list(db.as_deref()).await,
        Command::Reprocess { node_id, db } => cmd_reprocess(&node_id, db.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Resolve the database path from config or the --db override, expanding
/// a leading `~/`.
fn resolve_db_path(config: &AppConfig, flag: Option<&str>) -> Result<PathBuf> {
    let raw = flag
        .map(String::from)
        .unwrap_or_else(|| config.defaults.db_path.clone());
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| eyre!("cannot determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(raw))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_decompose(
    name: &str,
    mass: Option<f64>,
    unit: Option<&str>,
    supplier: Option<String>,
    depth: Option<u32>,
    db: Option<&str>,
) -> Result<()> {
    // Validate API key before doing anything
    let config = load_config()?;
    validate_api_key(&config)?;

    let unit = match unit {
        Some(u) => Some(MassUnit::parse(u).ok_or_else(|| eyre!("unknown mass unit '{u}'"))?),
        None => None,
    };
    if mass.is_some() != unit.is_some() {
        return Err(eyre!("--mass and --unit must be given together"));
    }

    let db_path = resolve_db_path(&config, db)?;
    let store = Arc::new(NodeStore::open(&db_path).await?);

    let api_key = std::env::var(&config.oracle.api_key_env)
        .map_err(|_| eyre!("{} is not set", config.oracle.api_key_env))?;
    let oracle = Arc::new(HttpOracle::new(config.oracle.base_url.clone(), api_key)?);

    let mut engine_config = EngineConfig::from(&config);
    if let Some(depth) = depth {
        engine_config.depth_cap = depth;
    }
    let poll_interval = engine_config.poll_interval_secs;
    let max_cycles = engine_config.max_poll_cycles;

    let engine = Engine::new(store, oracle, engine_config);
    let root = engine.start_tree(name, mass, unit, supplier).await?;

    info!(tree_id = %root.tree_id, name, "decomposition started");
    println!("Tree ID: {}", root.tree_id);

    let progress = CliProgress::new();
    let report = engine.run_tree(root.id, &progress).await?;
    if !report.converged {
        progress.finish();
        return Err(eyre!(
            "root tier did not converge within {max_cycles} poll cycles"
        ));
    }

    // The root tier is done; deeper tiers run as detached tasks and are
    // tracked only through the store.
    progress.phase("Expanding deeper tiers");
    let mut cycles = 0u32;
    loop {
        let unsettled = engine.store().count_unsettled(root.tree_id).await?;
        if unsettled == 0 {
            break;
        }
        cycles += 1;
        if cycles > max_cycles {
            warn!(unsettled, "giving up on deeper tiers, tree left partial");
            break;
        }
        progress.task_progress(cycles as usize, max_cycles as usize, &format!(
            "{unsettled} components still in flight"
        ));
        tokio::time::sleep(std::time::Duration::from_secs(poll_interval)).await;
    }
    progress.finish();

    let root_node = engine
        .store()
        .get_node(root.id)
        .await?
        .ok_or_else(|| eyre!("root node vanished from the store"))?;
    let tiers = engine.store().tier_counts(root.tree_id).await?;
    let total_nodes: u64 = tiers.iter().map(|(_, n)| n).sum();

    println!();
    println!("  Decomposition complete!");
    println!("  Tree:       {}", root.tree_id);
    println!("  Product:    {name}");
    println!("  Components: {total_nodes}");
    for (tier, count) in &tiers {
        println!("    tier {tier}: {count}");
    }
    println!("  Footprint:  {:.3} kgCO2e", root_node.full_emissions);
    if report.failed > 0 {
        println!("  Degraded:   {} components (see logs)", report.failed);
    }
    println!();

    Ok(())
}

async fn cmd_status(tree_id: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let db_path = resolve_db_path(&config, db)?;
    let store = NodeStore::open_readonly(&db_path).await?;

    let tree_id =
        TreeId::from_str(tree_id).map_err(|e| eyre!("invalid tree id '{tree_id}': {e}"))?;
    let (root_id, product_name, created_at) = store
        .get_tree(tree_id)
        .await?
        .ok_or_else(|| eyre!("no tree with id {tree_id}"))?;
    let root = store
        .get_node(root_id)
        .await?
        .ok_or_else(|| eyre!("tree {tree_id} has no root node"))?;

    let tiers = store.tier_counts(tree_id).await?;
    let total_nodes: u64 = tiers.iter().map(|(_, n)| n).sum();
    let unsettled = store.count_unsettled(tree_id).await?;

    println!();
    println!("  Tree:       {tree_id}");
    println!("  Product:    {product_name}");
    println!("  Created:    {created_at}");
    println!("  Status:     {}", root.status.as_str());
    println!("  Components: {total_nodes}");
    for (tier, count) in &tiers {
        println!("    tier {tier}: {count}");
    }
    println!("  In flight:  {unsettled}");
    println!("  Footprint:  {:.3} kgCO2e", root.full_emissions);
    println!();

    Ok(())
}

async fn cmd_list(db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let db_path = resolve_db_path(&config, db)?;
    let store = NodeStore::open_readonly(&db_path).await?;

    let trees = store.list_trees().await?;
    if trees.is_empty() {
        println!("No decomposition trees yet. Run `carbonbom decompose <product>`.");
        return Ok(());
    }
    for (id, name, created_at) in trees {
        println!("{id}  {created_at}  {name}");
    }
    Ok(())
}

async fn cmd_reprocess(node_id: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let node_id =
        NodeId::from_str(node_id).map_err(|e| eyre!("invalid node id '{node_id}': {e}"))?;
    let db_path = resolve_db_path(&config, db)?;
    let store = Arc::new(NodeStore::open(&db_path).await?);

    let api_key = std::env::var(&config.oracle.api_key_env)
        .map_err(|_| eyre!("{} is not set", config.oracle.api_key_env))?;
    let oracle = Arc::new(HttpOracle::new(config.oracle.base_url.clone(), api_key)?);

    let engine = Engine::new(store, oracle, EngineConfig::from(&config));
    info!(%node_id, "reprocessing component");

    let progress = CliProgress::new();
    let outcome = engine.reprocess(node_id, &progress).await?;
    progress.finish();

    let node = engine
        .store()
        .get_node(node_id)
        .await?
        .ok_or_else(|| eyre!("node {node_id} vanished from the store"))?;

    println!();
    println!("  Reprocessed: {}", node.name);
    println!("  Supplier:    {}", node.supplier_name.as_deref().unwrap_or("Unknown"));
    println!(
        "  Footprint:   {:.3} kgCO2e own ({:.3} production + {:.3} transport)",
        node.estimated_emissions + node.transport_emissions,
        node.estimated_emissions,
        node.transport_emissions,
    );
    if outcome.failed > 0 {
        println!("  Degraded:    some steps fell back to defaults (see logs)");
    }
    println!();

    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl EngineProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn task_progress(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("[{current}/{total}] {detail}"));
    }
}
