//! Configuration
//!
//! Options controlling which physical backend a manager runs on and in which
//! mode. Supports TOML config files with per-field defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::storage::error::{StoreError, StoreResult};

/// Storage manager configuration
///
/// Exactly one backend is selected at construction: `in_memory` wins over
/// `use_sql`; when neither is set the columnar file store is used.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreOptions {
    /// Hold arrays in heap memory instead of on disk
    #[serde(default)]
    pub in_memory: bool,

    /// Reject every mutating operation
    #[serde(default)]
    pub read_only: bool,

    /// Base directory for temporary storage media (system temp dir if unset)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Use the embedded SQL backend instead of columnar files
    #[serde(default)]
    pub use_sql: bool,

    /// Tag of the embedded SQL engine
    #[serde(default = "default_engine_name")]
    pub engine_name: String,
}

fn default_engine_name() -> String {
    crate::storage::sql::SQLITE_ENGINE.to_string()
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            in_memory: false,
            read_only: false,
            directory: None,
            use_sql: false,
            engine_name: default_engine_name(),
        }
    }
}

impl StoreOptions {
    /// Parse options from a TOML string
    pub fn from_toml(text: &str) -> StoreResult<Self> {
        toml::from_str(text).map_err(|e| StoreError::Serialization(format!("invalid options: {e}")))
    }

    /// Load options from a TOML file
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}
