// Archive Configuration - one immutable struct handed to every run
//
// Loaded from YAML or JSON (by file extension), validated once, then shared
// read-only. Modules are closed descriptors; nothing is discovered at runtime.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fiscal::{DateBounds, FiscalCalendar, FiscalYearTag, Partition, ORPHAN_FISCAL_YEAR};
use crate::warehouse::{RESERVED_TABLES, SNAPSHOT_PREFIX};

// ============================================================================
// MODULE DESCRIPTOR
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module name, also the top-level object-store folder (GL, AP, AM...)
    pub name: String,

    /// Authoritative close-date table
    pub date_table: String,

    /// Date column read from `date_table`
    pub date_column: String,

    /// Columns forming the business key, shared by every table of the module
    pub key_columns: Vec<String>,

    #[serde(default)]
    pub dependent_tables: Vec<String>,

    /// Overrides the deployment-wide fiscal year start month
    #[serde(default)]
    pub fiscal_year_start_month: Option<u32>,
}

impl ModuleConfig {
    /// Date table first, then dependents in configured order
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.date_table.as_str())
            .chain(self.dependent_tables.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalHoldConfig {
    pub module: String,
    pub fiscal_year: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_times")]
    pub max_times: usize,
}

impl RetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_times: default_max_times(),
        }
    }
}

// ============================================================================
// ARCHIVE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub retention_window_years: i32,
    pub min_year: i32,
    pub max_year: i32,

    #[serde(default = "default_start_month")]
    pub fiscal_year_start_month: u32,

    pub modules: Vec<ModuleConfig>,

    #[serde(default)]
    pub holds: Vec<LegalHoldConfig>,

    pub pct_threshold: f64,
    pub absolute_threshold: i64,

    #[serde(default = "default_snapshot_expiration_days")]
    pub snapshot_expiration_days: i64,

    /// Rows per object-store chunk
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,

    /// Worker pool size for every unit category
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Top-level folder inside the bucket
    #[serde(default)]
    pub object_root: String,

    /// Fail the sweep when reconciliation alerts (observational by default)
    #[serde(default)]
    pub reconciliation_blocking: bool,

    /// Re-counts of a mismatched partition before the verdict is final
    #[serde(default = "default_settle_attempts")]
    pub settle_attempts: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub paths: StoragePaths,
}

/// Local locations of the stores; each can be overridden from the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoragePaths {
    #[serde(default)]
    pub source_db: Option<PathBuf>,
    #[serde(default)]
    pub warehouse_db: Option<PathBuf>,
    #[serde(default)]
    pub object_dir: Option<PathBuf>,
    #[serde(default)]
    pub alert_log: Option<PathBuf>,
}

fn default_start_month() -> u32 {
    1
}

fn default_snapshot_expiration_days() -> i64 {
    30
}

fn default_chunk_rows() -> usize {
    50_000
}

fn default_workers() -> usize {
    4
}

fn default_settle_attempts() -> usize {
    3
}

fn default_min_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_times() -> usize {
    5
}

impl ArchiveConfig {
    /// Load from `.json`, `.yaml` or `.yml`, apply env overrides, validate
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let mut config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw)?,
            _ => Self::from_yaml_str(&raw)?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("Failed to parse YAML config")
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse JSON config")
    }

    fn apply_env_overrides(&mut self) {
        let read = |name: &str| std::env::var_os(name).map(PathBuf::from);
        if let Some(path) = read("FY_ARCHIVE_SOURCE_DB") {
            self.paths.source_db = Some(path);
        }
        if let Some(path) = read("FY_ARCHIVE_WAREHOUSE_DB") {
            self.paths.warehouse_db = Some(path);
        }
        if let Some(path) = read("FY_ARCHIVE_OBJECT_DIR") {
            self.paths.object_dir = Some(path);
        }
        if let Some(path) = read("FY_ARCHIVE_ALERT_LOG") {
            self.paths.alert_log = Some(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention_window_years < 0 {
            bail!("retention_window_years must not be negative");
        }
        if self.min_year > self.max_year {
            bail!("min_year {} is after max_year {}", self.min_year, self.max_year);
        }
        if !(1..=12).contains(&self.fiscal_year_start_month) {
            bail!("fiscal_year_start_month must be 1-12");
        }
        // The last fiscal year reachable from max_year must stay clear of the sentinel
        if self.max_year + 1 >= ORPHAN_FISCAL_YEAR {
            bail!("max_year must be below {}", ORPHAN_FISCAL_YEAR - 1);
        }
        if self.pct_threshold < 0.0 || self.absolute_threshold < 0 {
            bail!("alert thresholds must not be negative");
        }
        if self.chunk_rows == 0 || self.workers == 0 {
            bail!("chunk_rows and workers must be positive");
        }
        if self.snapshot_expiration_days <= 0 {
            bail!("snapshot_expiration_days must be positive");
        }
        if self.modules.is_empty() {
            bail!("at least one module must be configured");
        }

        let mut module_names = HashSet::new();
        let mut table_names = HashSet::new();
        for module in &self.modules {
            if !is_safe_identifier(&module.name) {
                bail!("module name {:?} is not a safe identifier", module.name);
            }
            if !module_names.insert(module.name.as_str()) {
                bail!("module {} is configured twice", module.name);
            }
            if module.key_columns.is_empty() {
                bail!("module {} has no key_columns", module.name);
            }
            if let Some(month) = module.fiscal_year_start_month {
                if !(1..=12).contains(&month) {
                    bail!("module {} fiscal_year_start_month must be 1-12", module.name);
                }
            }
            for column in module.key_columns.iter().chain([&module.date_column]) {
                if !is_safe_identifier(column) || column == PARTITION_COLUMN {
                    bail!("column {:?} in module {} is not allowed", column, module.name);
                }
            }
            for table in module.tables() {
                if !is_safe_identifier(table) {
                    bail!("table {:?} in module {} is not a safe identifier", table, module.name);
                }
                let lowered = table.to_ascii_lowercase();
                if RESERVED_TABLES.contains(&lowered.as_str()) || lowered.starts_with(SNAPSHOT_PREFIX) {
                    bail!("table name {} is reserved by the warehouse", table);
                }
                // A warehouse table belongs to exactly one module
                if !table_names.insert(table.to_ascii_lowercase()) {
                    bail!("table {} appears in more than one place", table);
                }
            }
        }

        for hold in &self.holds {
            if self.module(&hold.module).is_none() {
                bail!("legal hold references unknown module {}", hold.module);
            }
        }
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn calendar_for(&self, module: &ModuleConfig) -> FiscalCalendar {
        FiscalCalendar::new(
            module
                .fiscal_year_start_month
                .unwrap_or(self.fiscal_year_start_month),
        )
    }

    pub fn date_bounds(&self) -> DateBounds {
        DateBounds {
            min_year: self.min_year,
            max_year: self.max_year,
        }
    }

    pub fn is_held_by_config(&self, partition: &Partition) -> bool {
        self.holds.iter().any(|hold| {
            hold.module == partition.module
                && FiscalYearTag::from_value(hold.fiscal_year) == partition.tag
        })
    }
}

/// Warehouse column carrying the fiscal year tag on every partitioned table
pub const PARTITION_COLUMN: &str = "fy_partition";

/// Identifiers are interpolated into SQL and object paths
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_YAML: &str = r#"
retention_window_years: 7
min_year: 1990
max_year: 2030
fiscal_year_start_month: 1
pct_threshold: 0.05
absolute_threshold: 100
chunk_rows: 2
workers: 2
object_root: finsup
modules:
  - name: GL
    date_table: JRNL_HDR
    date_column: ACCOUNTING_DT
    key_columns: [BUSINESS_UNIT, JOURNAL_ID]
    dependent_tables: [JRNL_LN, JRNL_VAT]
holds:
  - module: GL
    fiscal_year: 2016
"#;

    pub(crate) fn sample_config() -> ArchiveConfig {
        let config = ArchiveConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_yaml_defaults() {
        let config = sample_config();
        assert_eq!(config.snapshot_expiration_days, 30);
        assert_eq!(config.settle_attempts, 3);
        assert!(!config.reconciliation_blocking);
        assert_eq!(config.retry.max_times, 5);
        assert_eq!(
            config.modules[0].tables(),
            vec!["JRNL_HDR", "JRNL_LN", "JRNL_VAT"]
        );
    }

    #[test]
    fn test_json_config() {
        let json = serde_json::to_string(&sample_config()).unwrap();
        let config = ArchiveConfig::from_json_str(&json).unwrap();
        assert_eq!(config.modules[0].key_columns.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_held_by_config() {
        let config = sample_config();
        assert!(config.is_held_by_config(&Partition::new("GL", FiscalYearTag::Year(2016))));
        assert!(!config.is_held_by_config(&Partition::new("GL", FiscalYearTag::Year(2017))));
        assert!(!config.is_held_by_config(&Partition::new("AP", FiscalYearTag::Year(2016))));
    }

    #[test]
    fn test_rejects_unsafe_and_duplicate_tables() {
        let mut config = sample_config();
        config.modules[0].dependent_tables.push("JRNL_LN; DROP".to_string());
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.modules[0].dependent_tables.push("jrnl_hdr".to_string());
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.modules[0].key_columns.clear();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.max_year = 2098;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_module_calendar_override() {
        let mut config = sample_config();
        config.modules[0].fiscal_year_start_month = Some(7);
        let calendar = config.calendar_for(&config.modules[0]);
        assert_eq!(calendar.start_month(), 7);
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("PS_JRNL_LN"));
        assert!(is_safe_identifier("_tmp1"));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier("a-b"));
        assert!(!is_safe_identifier(""));
    }
}
