// Sweep - one archival cycle over every configured module
//
// Phases run in order across all modules: archive (resolve, tag, write),
// retention, reconciliation. A module's writes therefore finish before its
// deletion, and deletion before its reconciliation. Inside a phase units run on
// the bounded worker pool and fail independently; the sweep reports the worst
// unit outcome instead of aborting.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::alerts::AlertSink;
use crate::config::{ArchiveConfig, ModuleConfig};
use crate::fiscal::FiscalYearTag;
use crate::object_store::ObjectStore;
use crate::reconciliation::{AuditSink, PartitionReconciliation, ReconciliationEngine, SourceCounts};
use crate::resolver::{FiscalYearResolver, ResolvedKeys};
use crate::retention::{
    DeletionEngine, DeletionPlan, DeletionScope, DeletionTargets, PartitionDeletionReport,
    RetentionWindow,
};
use crate::source::SourceStore;
use crate::warehouse::Warehouse;
use crate::workers::{retry_transient, CancelToken, UnitStatus, WorkerPool};
use crate::writer::{PartitionedWriter, TableWriteReport};

/// Every store a sweep touches
#[derive(Clone, Copy)]
pub struct Stores<'a> {
    pub source: &'a dyn SourceStore,
    pub objects: &'a dyn ObjectStore,
    pub warehouse: &'a dyn Warehouse,
    pub audit: &'a dyn AuditSink,
    pub alerts: &'a dyn AlertSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub archive: bool,
    pub retention: bool,
    pub reconcile: bool,
}

impl Phases {
    pub fn all() -> Self {
        Phases {
            archive: true,
            retention: true,
            reconcile: true,
        }
    }

    pub fn only_archive() -> Self {
        Phases {
            archive: true,
            retention: false,
            reconcile: false,
        }
    }

    pub fn only_retention() -> Self {
        Phases {
            archive: false,
            retention: true,
            reconcile: false,
        }
    }

    pub fn only_reconcile() -> Self {
        Phases {
            archive: false,
            retention: false,
            reconcile: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub phases: Phases,
    /// Module and fiscal-year scope for every phase; `force` only matters to retention
    pub scope: DeletionScope,
    pub targets: DeletionTargets,
    /// Plan retention without executing it
    pub dry_run: bool,
    /// Date the retention window is measured from
    pub as_of: NaiveDate,
}

impl Default for SweepOptions {
    fn default() -> Self {
        SweepOptions {
            phases: Phases::all(),
            scope: DeletionScope::default(),
            targets: DeletionTargets::Both,
            dry_run: false,
            as_of: Utc::now().date_naive(),
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Resolve,
    Write,
    Plan,
    Delete,
    Count,
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub kind: UnitKind,
    /// `GL/JRNL_LN`, `GL/FY2017`, ...
    pub unit: String,
    pub status: UnitStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub run_id: String,
    pub units: Vec<UnitReport>,
    pub writes: Vec<TableWriteReport>,
    pub plan: Option<DeletionPlan>,
    pub deletions: Vec<PartitionDeletionReport>,
    pub reconciliations: Vec<PartitionReconciliation>,
}

/// Process exit code for the worst unit outcome of a sweep
pub fn exit_code_for(status: UnitStatus) -> i32 {
    match status {
        UnitStatus::Succeeded | UnitStatus::Skipped | UnitStatus::Alerted => 0,
        UnitStatus::Failed => 1,
        UnitStatus::Partial => 2,
        UnitStatus::Cancelled => 3,
    }
}

impl SweepReport {
    pub fn worst(&self) -> UnitStatus {
        self.units
            .iter()
            .map(|u| u.status)
            .max()
            .unwrap_or(UnitStatus::Succeeded)
    }

    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.worst())
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    fn push(&mut self, kind: UnitKind, unit: impl Into<String>, status: UnitStatus, error: Option<String>) {
        self.units.push(UnitReport {
            kind,
            unit: unit.into(),
            status,
            error,
        });
    }
}

// ============================================================================
// SWEEP
// ============================================================================

pub struct Sweep<'a> {
    config: &'a ArchiveConfig,
    stores: Stores<'a>,
    pool: WorkerPool,
    run_id: String,
}

impl<'a> Sweep<'a> {
    pub fn new(config: &'a ArchiveConfig, stores: Stores<'a>, cancel: CancelToken) -> Self {
        Sweep {
            config,
            stores,
            pool: WorkerPool::new(config.workers, cancel),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn modules(&self, scope: &DeletionScope) -> Vec<&'a ModuleConfig> {
        self.config
            .modules
            .iter()
            .filter(|m| scope.module.as_deref().map_or(true, |name| name == m.name))
            .collect()
    }

    pub fn run(&self, options: &SweepOptions) -> SweepReport {
        let mut report = SweepReport {
            run_id: self.run_id.clone(),
            ..SweepReport::default()
        };
        info!(run_id = %self.run_id, as_of = %options.as_of, "Sweep started");

        if options.phases.archive {
            self.archive(options, &mut report);
        }
        if options.phases.retention {
            self.retention(options, &mut report);
        }
        if options.phases.reconcile {
            self.reconcile(options, &mut report);
        }

        info!(
            run_id = %self.run_id,
            units = report.units.len(),
            failed = report.count(UnitStatus::Failed),
            partial = report.count(UnitStatus::Partial),
            alerted = report.count(UnitStatus::Alerted),
            worst = ?report.worst(),
            "Sweep finished"
        );
        report
    }

    // ------------------------------------------------------------------------
    // Archive
    // ------------------------------------------------------------------------

    fn archive(&self, options: &SweepOptions, report: &mut SweepReport) {
        let modules = self.modules(&options.scope);

        let resolved = self.pool.run(modules.clone(), |module| {
            let resolver = FiscalYearResolver::for_module(self.config, module);
            retry_transient(&self.config.retry, "resolve fiscal years", || {
                resolver.resolve(self.stores.source, module)
            })
        });

        let mut keys: Vec<(&ModuleConfig, ResolvedKeys)> = Vec::new();
        for (module, outcome) in modules.into_iter().zip(resolved) {
            match outcome {
                Some(Ok(resolved)) => {
                    report.push(UnitKind::Resolve, &module.name, UnitStatus::Succeeded, None);
                    keys.push((module, resolved));
                }
                Some(Err(e)) => {
                    error!(module = %module.name, error = %e, "Fiscal year resolution failed");
                    report.push(UnitKind::Resolve, &module.name, UnitStatus::Failed, Some(e.to_string()));
                }
                None => report.push(UnitKind::Resolve, &module.name, UnitStatus::Cancelled, None),
            }
        }

        let units: Vec<(&ModuleConfig, &ResolvedKeys, &str)> = keys
            .iter()
            .flat_map(|(module, resolved)| {
                module
                    .tables()
                    .into_iter()
                    .map(move |table| (*module, resolved, table))
            })
            .collect();
        let labels: Vec<String> = units
            .iter()
            .map(|(module, _, table)| format!("{}/{}", module.name, table))
            .collect();

        let results = self.pool.run(units, |(module, resolved, table)| {
            let window = RetentionWindow::as_of(
                self.config.calendar_for(module),
                self.config.retention_window_years,
                options.as_of,
            );
            PartitionedWriter::new(
                self.config,
                self.stores.source,
                self.stores.objects,
                self.stores.warehouse,
                window,
                self.run_id.as_str(),
            )
            .write_table(module, resolved, table)
        });

        for (label, outcome) in labels.into_iter().zip(results) {
            match outcome {
                Some(Ok(write)) => {
                    report.push(UnitKind::Write, label, UnitStatus::Succeeded, None);
                    report.writes.push(write);
                }
                Some(Err(e)) => {
                    error!(unit = %label, error = %e, "Table archive failed");
                    report.push(UnitKind::Write, label, UnitStatus::Failed, Some(e.to_string()));
                }
                None => report.push(UnitKind::Write, label, UnitStatus::Cancelled, None),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------------

    fn retention(&self, options: &SweepOptions, report: &mut SweepReport) {
        let engine = DeletionEngine::new(self.config, self.stores.objects, self.stores.warehouse)
            .with_targets(options.targets)
            .as_of(options.as_of);

        let plan = match engine.plan(&options.scope) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Retention planning failed");
                report.push(UnitKind::Plan, "retention", UnitStatus::Failed, Some(e.to_string()));
                return;
            }
        };
        report.push(UnitKind::Plan, "retention", UnitStatus::Succeeded, None);

        if options.dry_run {
            info!(
                delete = plan.to_delete().count(),
                held = plan.held().count(),
                "Dry run, retention plan not executed"
            );
            report.plan = Some(plan);
            return;
        }

        let partitions = plan.partitions.clone();
        let labels: Vec<String> = partitions.iter().map(|p| p.partition.to_string()).collect();
        let results = self.pool.run(partitions, |partition| engine.execute_partition(&partition));

        for (label, outcome) in labels.into_iter().zip(results) {
            match outcome {
                Some(deletion) => {
                    let error = deletion
                        .tables
                        .iter()
                        .filter_map(|t| t.error.clone())
                        .chain(deletion.object_error.clone())
                        .next();
                    report.push(UnitKind::Delete, label, deletion.status.unit_status(), error);
                    report.deletions.push(deletion);
                }
                None => report.push(UnitKind::Delete, label, UnitStatus::Cancelled, None),
            }
        }
        report.plan = Some(plan);
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    fn reconcile(&self, options: &SweepOptions, report: &mut SweepReport) {
        let engine = ReconciliationEngine::new(
            self.config,
            self.stores.source,
            self.stores.warehouse,
            self.stores.audit,
            self.stores.alerts,
            self.run_id.as_str(),
        );

        let mut counts: BTreeMap<String, SourceCounts> = BTreeMap::new();
        let mut units: Vec<(&ModuleConfig, FiscalYearTag)> = Vec::new();
        for module in self.modules(&options.scope) {
            if self.pool.cancel_token().is_cancelled() {
                report.push(UnitKind::Count, &module.name, UnitStatus::Cancelled, None);
                continue;
            }
            let window = RetentionWindow::as_of(
                self.config.calendar_for(module),
                self.config.retention_window_years,
                options.as_of,
            );
            let checked = match engine.count_source(module) {
                Ok(module_counts) => engine
                    .partitions_to_check(module, &module_counts, window)
                    .map(|tags| (module_counts, tags)),
                Err(e) => Err(e),
            };
            match checked {
                Ok((module_counts, tags)) => {
                    report.push(UnitKind::Count, &module.name, UnitStatus::Succeeded, None);
                    counts.insert(module.name.clone(), module_counts);
                    units.extend(
                        tags.into_iter()
                            .filter(|tag| options.scope.fiscal_year.map_or(true, |y| y == tag.value()))
                            .map(|tag| (module, tag)),
                    );
                }
                Err(e) => {
                    error!(module = %module.name, error = %e, "Source count failed");
                    report.push(UnitKind::Count, &module.name, UnitStatus::Failed, Some(e.to_string()));
                }
            }
        }

        let labels: Vec<String> = units
            .iter()
            .map(|(module, tag)| format!("{}/{}", module.name, tag.folder()))
            .collect();
        let empty = SourceCounts::default();
        let counts = &counts;
        let results = self.pool.run(units, |(module, tag)| {
            let module_counts = counts.get(&module.name).unwrap_or(&empty);
            engine.reconcile_partition(module, tag, module_counts)
        });

        let blocking = self.config.reconciliation_blocking;
        for (label, outcome) in labels.into_iter().zip(results) {
            match outcome {
                Some(Ok(result)) => {
                    let status = result.unit_status(blocking);
                    if status == UnitStatus::Failed {
                        warn!(unit = %label, "Reconciliation alert fails the sweep");
                    }
                    report.push(UnitKind::Reconcile, label, status, None);
                    report.reconciliations.push(result);
                }
                Some(Err(e)) => {
                    error!(unit = %label, error = %e, "Reconciliation failed");
                    report.push(UnitKind::Reconcile, label, UnitStatus::Failed, Some(e.to_string()));
                }
                None => report.push(UnitKind::Reconcile, label, UnitStatus::Cancelled, None),
            }
        }
    }
}
