// Reconciliation Engine - source vs. archive row counts per partition
//
// For one (module, fiscal year) the engine compares, per table, the rows the
// operational store assigns to that year with the rows the warehouse holds in
// that `fy_partition`. Source counts use the module's own date source, so a
// key moves years in both counts at once.
//
//   delta = target - source
//   pct   = delta / source        (undefined when source = 0)
//   alert = |pct| > pct_threshold OR |delta| > absolute_threshold
//
// Every comparison lands in the audit trail whether or not it alerted.

use backon::BackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::alerts::{AlertEvent, AlertSink, Severity};
use crate::config::{ArchiveConfig, ModuleConfig};
use crate::error::{ArchiveError, ArchiveResult};
use crate::fiscal::{FiscalYearTag, Partition};
use crate::resolver::FiscalYearResolver;
use crate::retention::{is_under_hold, RetentionWindow};
use crate::source::SourceStore;
use crate::tagger::CrossTableTagger;
use crate::warehouse::{SqliteWarehouse, Warehouse};
use crate::workers::{backoff, retry_transient, UnitStatus};

// ============================================================================
// RECORDS
// ============================================================================

/// One row of the reconciliation audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub run_id: String,
    pub module: String,
    pub table: String,
    pub fiscal_year: i32,
    pub source_count: u64,
    pub target_count: u64,
    pub delta: i64,
    pub pct: Option<f64>,
    pub alerted: bool,
    pub severity: Option<Severity>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    pub fn alert_event(&self) -> Option<AlertEvent> {
        let severity = self.severity?;
        Some(AlertEvent {
            module: self.module.clone(),
            table: self.table.clone(),
            fiscal_year: self.fiscal_year,
            source_count: self.source_count,
            target_count: self.target_count,
            delta: self.delta,
            pct: self.pct,
            severity,
            run_id: self.run_id.clone(),
        })
    }
}

/// Append-only destination for reconciliation records
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &ReconciliationRecord) -> ArchiveResult<()>;
}

impl AuditSink for SqliteWarehouse {
    fn append(&self, record: &ReconciliationRecord) -> ArchiveResult<()> {
        self.append_reconciliation(record)
    }
}

// ============================================================================
// THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub pct: f64,
    pub absolute: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub delta: i64,
    pub pct: Option<f64>,
    pub severity: Option<Severity>,
}

impl Thresholds {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Thresholds {
            pct: config.pct_threshold,
            absolute: config.absolute_threshold,
        }
    }

    pub fn evaluate(&self, source_count: u64, target_count: u64) -> Verdict {
        let delta = target_count as i64 - source_count as i64;
        let pct = (source_count > 0).then(|| delta as f64 / source_count as f64);

        let pct_breached = pct.is_some_and(|p| p.abs() > self.pct);
        let delta_breached = delta.abs() > self.absolute;
        let severity = match (pct_breached, delta_breached) {
            (true, true) => Some(Severity::Critical),
            (true, false) | (false, true) => Some(Severity::Warning),
            (false, false) => None,
        };
        Verdict {
            delta,
            pct,
            severity,
        }
    }
}

// ============================================================================
// SOURCE COUNTS
// ============================================================================

/// Operational rows per table and fiscal year for one module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceCounts {
    pub per_table: BTreeMap<String, BTreeMap<FiscalYearTag, u64>>,
}

impl SourceCounts {
    pub fn get(&self, table: &str, tag: FiscalYearTag) -> u64 {
        self.per_table
            .get(table)
            .and_then(|counts| counts.get(&tag))
            .copied()
            .unwrap_or(0)
    }

    pub fn tags(&self) -> BTreeSet<FiscalYearTag> {
        self.per_table
            .values()
            .flat_map(|counts| counts.keys().copied())
            .collect()
    }
}

// ============================================================================
// PARTITION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReconciliation {
    pub partition: Partition,
    pub records: Vec<ReconciliationRecord>,
    /// Counting rounds, including the settle re-counts
    pub attempts: usize,
}

impl PartitionReconciliation {
    pub fn alerted(&self) -> bool {
        self.records.iter().any(|r| r.alerted)
    }

    pub fn unit_status(&self, blocking: bool) -> UnitStatus {
        match (self.alerted(), blocking) {
            (false, _) => UnitStatus::Succeeded,
            (true, false) => UnitStatus::Alerted,
            (true, true) => UnitStatus::Failed,
        }
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

type RecountSlot = Arc<Mutex<Option<Arc<SourceCounts>>>>;

pub struct ReconciliationEngine<'a> {
    config: &'a ArchiveConfig,
    source: &'a dyn SourceStore,
    warehouse: &'a dyn Warehouse,
    audit: &'a dyn AuditSink,
    alerts: &'a dyn AlertSink,
    thresholds: Thresholds,
    run_id: String,
    /// Settle counts per (module, round), taken once and shared by partitions
    recounts: Mutex<BTreeMap<(String, usize), RecountSlot>>,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(
        config: &'a ArchiveConfig,
        source: &'a dyn SourceStore,
        warehouse: &'a dyn Warehouse,
        audit: &'a dyn AuditSink,
        alerts: &'a dyn AlertSink,
        run_id: impl Into<String>,
    ) -> Self {
        ReconciliationEngine {
            config,
            source,
            warehouse,
            audit,
            alerts,
            thresholds: Thresholds::from_config(config),
            run_id: run_id.into(),
            recounts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve the module and count every table's rows per fiscal year
    pub fn count_source(&self, module: &ModuleConfig) -> ArchiveResult<SourceCounts> {
        let resolver = FiscalYearResolver::for_module(self.config, module);
        let resolved = retry_transient(&self.config.retry, "resolve fiscal years", || {
            resolver.resolve(self.source, module)
        })?;
        let tagger = CrossTableTagger::new(&resolved, module);

        let mut counts = SourceCounts::default();
        for table in module.tables() {
            let per_tag = retry_transient(&self.config.retry, "count source rows", || {
                tagger.count_table(self.source, table, self.config.chunk_rows)
            })?;
            counts.per_table.insert(table.to_string(), per_tag);
        }
        Ok(counts)
    }

    /// Source counts for settle round `round`; the first partition of the
    /// module to reach that round counts, the rest reuse its result
    fn recount(&self, module: &ModuleConfig, round: usize) -> ArchiveResult<Arc<SourceCounts>> {
        let slot = {
            let mut slots = self
                .recounts
                .lock()
                .map_err(|_| ArchiveError::transient("recount lock", "mutex poisoned"))?;
            Arc::clone(slots.entry((module.name.clone(), round)).or_default())
        };
        let mut counts = slot
            .lock()
            .map_err(|_| ArchiveError::transient("recount lock", "mutex poisoned"))?;
        if let Some(fresh) = counts.as_ref() {
            return Ok(Arc::clone(fresh));
        }
        let fresh = Arc::new(self.count_source(module)?);
        *counts = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Partitions worth checking: present on either side and still inside the
    /// window, or past it but under a legal hold
    pub fn partitions_to_check(
        &self,
        module: &ModuleConfig,
        counts: &SourceCounts,
        window: RetentionWindow,
    ) -> ArchiveResult<Vec<FiscalYearTag>> {
        let mut tags = counts.tags();
        for table in module.tables() {
            let present = retry_transient(&self.config.retry, "list partitions", || {
                self.warehouse.partitions(table)
            })?;
            tags.extend(present);
        }
        tags.insert(FiscalYearTag::Orphan);

        let mut checked = Vec::new();
        for tag in tags {
            if !window.is_expired(tag)
                || is_under_hold(self.config, self.warehouse, &Partition::new(&module.name, tag))?
            {
                checked.push(tag);
            }
        }
        Ok(checked)
    }

    fn compare(
        &self,
        module: &ModuleConfig,
        tag: FiscalYearTag,
        counts: &SourceCounts,
    ) -> ArchiveResult<Vec<ReconciliationRecord>> {
        let mut records = Vec::new();
        for table in module.tables() {
            let source_count = counts.get(table, tag);
            let target_count = retry_transient(&self.config.retry, "count archived rows", || {
                self.warehouse.count_partition(table, tag)
            })?;
            let verdict = self.thresholds.evaluate(source_count, target_count);
            records.push(ReconciliationRecord {
                run_id: self.run_id.clone(),
                module: module.name.clone(),
                table: table.to_string(),
                fiscal_year: tag.value(),
                source_count,
                target_count,
                delta: verdict.delta,
                pct: verdict.pct,
                alerted: verdict.severity.is_some(),
                severity: verdict.severity,
                reconciled_at: Utc::now(),
            });
        }
        Ok(records)
    }

    /// Compare one partition, letting a mismatch settle before the final
    /// verdict, then record and alert
    pub fn reconcile_partition(
        &self,
        module: &ModuleConfig,
        tag: FiscalYearTag,
        counts: &SourceCounts,
    ) -> ArchiveResult<PartitionReconciliation> {
        let partition = Partition::new(&module.name, tag);
        let mut records = self.compare(module, tag, counts)?;
        let mut attempts = 1;

        let mut delays = backoff(&self.config.retry).build();
        while records.iter().any(|r| r.alerted) && attempts <= self.config.settle_attempts {
            let delay = delays.next().unwrap_or_else(|| self.config.retry.max_delay());
            debug!(partition = %partition, attempt = attempts, ?delay, "Counts differ, re-counting");
            std::thread::sleep(delay);
            let fresh = self.recount(module, attempts)?;
            records = self.compare(module, tag, &fresh)?;
            attempts += 1;
        }

        let mut alert_error = None;
        for record in &records {
            retry_transient(&self.config.retry, "append audit record", || {
                self.audit.append(record)
            })?;
            if let Some(event) = record.alert_event() {
                if let Err(e) = self.alerts.emit(&event) {
                    error!(partition = %partition, table = %record.table, error = %e, "Alert delivery failed");
                    alert_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = alert_error {
            return Err(e);
        }

        let result = PartitionReconciliation {
            partition,
            records,
            attempts,
        };
        info!(
            partition = %result.partition,
            tables = result.records.len(),
            alerted = result.alerted(),
            attempts,
            "Partition reconciled"
        );
        Ok(result)
    }
}
