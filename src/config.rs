use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeSet;
use crate::merge::MissingPolicy;

fn default_dimension() -> String {
    "product_catalog".to_string()
}

fn default_key_column() -> String {
    "product_id".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub on_missing: MissingPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Fewer rows than this (but more than zero) is a LOW_VOLUME warning
    #[serde(default = "GateConfig::default_min_row_floor")]
    pub min_row_floor: usize,
    /// Latest valid_from older than this is a STALE_DATA warning
    #[serde(default = "GateConfig::default_freshness_window_hours")]
    pub freshness_window_hours: i64,
}

impl GateConfig {
    fn default_min_row_floor() -> usize {
        100
    }

    fn default_freshness_window_hours() -> i64 {
        48
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.freshness_window_hours)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_row_floor: Self::default_min_row_floor(),
            freshness_window_hours: Self::default_freshness_window_hours(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_db_path")]
    pub db_path: PathBuf,
    /// Post-run backups are skipped when unset
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

impl StorageConfig {
    fn default_db_path() -> PathBuf {
        PathBuf::from("dimension.db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_db_path(),
            backup_dir: None,
        }
    }
}

/// Everything one dimension pipeline needs, passed in at construction time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_dimension")]
    pub dimension: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default)]
    pub attributes: AttributeSet,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            key_column: default_key_column(),
            attributes: AttributeSet::product_catalog(),
            merge: MergeConfig::default(),
            gate: GateConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Scaffold a config file with the product catalog defaults
    pub fn write_default(path: &Path) -> Result<Self> {
        if path.exists() {
            bail!("config {} already exists", path.display());
        }
        let config = PipelineConfig::default();
        let payload = serde_json::to_string_pretty(&config).context("serialize config")?;
        fs::write(path, payload).with_context(|| format!("write config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension.trim().is_empty() {
            bail!("dimension name must not be empty");
        }
        if self.key_column.trim().is_empty() {
            bail!("key_column must not be empty");
        }
        if self.attributes.is_empty() {
            bail!("attribute set must not be empty");
        }
        let dupes = self.attributes.duplicate_names();
        if !dupes.is_empty() {
            bail!("attributes declared more than once: {}", dupes.join(", "));
        }
        if self.attributes.get(&self.key_column).is_some() {
            bail!(
                "key column '{}' must not also be declared as an attribute",
                self.key_column
            );
        }
        if self.attributes.tracked().next().is_none() {
            bail!("at least one attribute must be tracked");
        }
        if self.gate.freshness_window_hours <= 0 {
            bail!("gate.freshness_window_hours must be > 0");
        }
        Ok(())
    }
}
