use crate::cluster::{GroupingStrategy, ScanOptions};
use crate::error::{EngineError, Result};
use crate::matcher::MatchOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that points at the config file
pub const CONFIG_ENV: &str = "CATALOG_RESOLUTION_CONFIG";

/// Config file looked up in the working directory when the variable is unset
pub const DEFAULT_CONFIG_FILE: &str = "catalog-resolution.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub matching: MatchOptions,
    pub scan: ScanConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub strategy: GroupingStrategy,
    pub parallel: bool,
    pub parallel_min_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-scan overrides of the configured matching and grouping.
///
/// A merge must rebuild its group with the same parameters the operator
/// scanned with, so scan and merge requests both carry one of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    pub strategy: Option<GroupingStrategy>,
    pub name_similarity_threshold: Option<f64>,
    /// Pairs the operator marked as not duplicates, in either order
    pub dismissed: Vec<(String, String)>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("catalog.db"),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        let defaults = ScanOptions::default();
        Self {
            strategy: defaults.strategy,
            parallel: defaults.parallel,
            parallel_min_records: defaults.parallel_min_records,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

// ─── Load ──────────────────────────────────────────────────

impl EngineConfig {
    /// `$CATALOG_RESOLUTION_CONFIG`, else `./catalog-resolution.toml`
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load config from the standard path, falling back to defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        if self.store.database_path.as_os_str().is_empty() {
            return Err(EngineError::validation("store.database_path is empty"));
        }
        if self.server.host.trim().is_empty() {
            return Err(EngineError::validation("server.host is empty"));
        }
        Ok(())
    }

    /// Scan options for this config (no dismissed pairs)
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            matching: self.matching.clone(),
            strategy: self.scan.strategy,
            parallel: self.scan.parallel,
            parallel_min_records: self.scan.parallel_min_records,
            ..ScanOptions::default()
        }
    }

    /// Scan options for this config with `params` applied on top
    pub fn scan_options_with(&self, params: &ScanParams) -> Result<ScanOptions> {
        let mut options = self.scan_options();
        if let Some(strategy) = params.strategy {
            options.strategy = strategy;
        }
        if let Some(threshold) = params.name_similarity_threshold {
            options.matching.name_similarity_threshold = threshold;
            options.matching.validate()?;
        }
        for (a, b) in &params.dismissed {
            options = options.dismiss(a, b);
        }
        Ok(options)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
