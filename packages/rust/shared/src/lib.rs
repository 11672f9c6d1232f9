//! Shared types, error model, and configuration for CarbonBOM.
//!
//! This crate is the foundation depended on by all other CarbonBOM crates.
//! It provides:
//! - [`CarbonBomError`] — the unified error type
//! - Domain types ([`Node`], [`NodeStatus`], [`ProgressFlags`], [`BomItem`], [`NodeId`])
//! - Configuration ([`AppConfig`], [`EngineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, EngineConfig, OracleConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{CarbonBomError, Result};
pub use types::{
    BomItem, MassUnit, Node, NodeId, NodeStatus, ProgressFlag, ProgressFlags, TreeId, Verdict,
};
