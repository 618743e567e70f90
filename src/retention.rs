// Retention Deletion Engine - rolling window over fiscal-year partitions
//
// Planning and execution are split: `plan` decides, for every partition in
// scope, what would be snapshotted and removed; `execute_partition` carries a
// single planned partition out. A dry run is just a plan that is never
// executed, so what an operator previews is exactly what runs.
//
// Per table the engine walks a small state machine:
//
//   Active -> Eligible -> Held
//                      -> Snapshotting -> Snapshotted -> Deleting -> Deleted
//                                      -> SnapshotFailed          -> DeleteFailed
//
// Every snapshot of a partition must succeed before any row of it is removed.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{error, info, warn};

use crate::config::{ArchiveConfig, ModuleConfig, PARTITION_COLUMN};
use crate::error::{ArchiveError, ArchiveResult};
use crate::fiscal::{module_prefix, FiscalCalendar, FiscalYearTag, Partition, ORPHAN_FISCAL_YEAR};
use crate::object_store::ObjectStore;
use crate::warehouse::{SnapshotRecord, Warehouse};
use crate::workers::{retry_transient, UnitStatus};

// ============================================================================
// RETENTION WINDOW
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionWindow {
    pub current_fiscal_year: i32,
    pub window_years: i32,
}

impl RetentionWindow {
    pub fn as_of(calendar: FiscalCalendar, window_years: i32, date: NaiveDate) -> Self {
        RetentionWindow {
            current_fiscal_year: calendar.fiscal_year(date),
            window_years,
        }
    }

    /// Window for a module, measured from today in that module's calendar
    pub fn current(config: &ArchiveConfig, module: &ModuleConfig) -> Self {
        Self::as_of(
            config.calendar_for(module),
            config.retention_window_years,
            Utc::now().date_naive(),
        )
    }

    /// Older than the window; the orphan partition never ages out
    pub fn is_expired(&self, tag: FiscalYearTag) -> bool {
        match tag {
            FiscalYearTag::Orphan => false,
            FiscalYearTag::Year(year) => self.current_fiscal_year - year > self.window_years,
        }
    }
}

/// Configured holds first, then the hold registry
pub fn is_under_hold(
    config: &ArchiveConfig,
    warehouse: &dyn Warehouse,
    partition: &Partition,
) -> ArchiveResult<bool> {
    if config.is_held_by_config(partition) {
        return Ok(true);
    }
    retry_transient(&config.retry, "check legal hold", || warehouse.is_held(partition))
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionState {
    Active,
    Eligible,
    Held,
    Snapshotting,
    Snapshotted,
    Deleting,
    Deleted,
    SnapshotFailed,
    DeleteFailed,
}

impl DeletionState {
    pub fn can_transition(self, next: DeletionState) -> bool {
        use DeletionState::*;
        matches!(
            (self, next),
            (Active, Eligible)
                | (Eligible, Held)
                | (Eligible, Snapshotting)
                | (Snapshotting, Snapshotted)
                | (Snapshotting, SnapshotFailed)
                | (Snapshotted, Deleting)
                | (Deleting, Deleted)
                | (Deleting, DeleteFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeletionState::Held
                | DeletionState::Deleted
                | DeletionState::SnapshotFailed
                | DeletionState::DeleteFailed
        )
    }
}

impl fmt::Display for DeletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeletionState::Active => "ACTIVE",
            DeletionState::Eligible => "ELIGIBLE",
            DeletionState::Held => "HELD",
            DeletionState::Snapshotting => "SNAPSHOTTING",
            DeletionState::Snapshotted => "SNAPSHOTTED",
            DeletionState::Deleting => "DELETING",
            DeletionState::Deleted => "DELETED",
            DeletionState::SnapshotFailed => "SNAPSHOT_FAILED",
            DeletionState::DeleteFailed => "DELETE_FAILED",
        };
        write!(f, "{}", name)
    }
}

/// One table's walk through the deletion states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLifecycle {
    pub table: String,
    pub history: Vec<DeletionState>,
}

impl TableLifecycle {
    pub fn new(table: impl Into<String>) -> Self {
        TableLifecycle {
            table: table.into(),
            history: vec![DeletionState::Active],
        }
    }

    pub fn state(&self) -> DeletionState {
        self.history
            .last()
            .copied()
            .unwrap_or(DeletionState::Active)
    }

    pub fn advance(&mut self, next: DeletionState) -> ArchiveResult<()> {
        let current = self.state();
        if !current.can_transition(next) {
            return Err(ArchiveError::IllegalTransition {
                table: self.table.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.history.push(next);
        Ok(())
    }

    /// Whether `earlier` was reached before `later`
    pub fn reached_before(&self, earlier: DeletionState, later: DeletionState) -> bool {
        let first = self.history.iter().position(|s| *s == earlier);
        let second = self.history.iter().position(|s| *s == later);
        matches!((first, second), (Some(a), Some(b)) if a < b)
    }
}

// ============================================================================
// SCOPE & PLAN
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionScope {
    pub module: Option<String>,
    pub fiscal_year: Option<i32>,
    /// Bypass the age window for the scoped year; holds still apply
    #[serde(default)]
    pub force: bool,
}

impl DeletionScope {
    fn includes_module(&self, name: &str) -> bool {
        self.module.as_deref().map_or(true, |m| m == name)
    }

    fn includes_tag(&self, tag: FiscalYearTag) -> bool {
        self.fiscal_year.map_or(true, |year| year == tag.value())
    }

    fn forces(&self, tag: FiscalYearTag) -> bool {
        self.force && self.fiscal_year == Some(tag.value())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionTargets {
    #[default]
    Both,
    TablesOnly,
    ObjectsOnly,
}

impl DeletionTargets {
    pub fn tables(self) -> bool {
        matches!(self, DeletionTargets::Both | DeletionTargets::TablesOnly)
    }

    pub fn objects(self) -> bool {
        matches!(self, DeletionTargets::Both | DeletionTargets::ObjectsOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Delete,
    Held,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOp {
    pub table: String,
    /// `fy_partition = <year>`
    pub predicate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub partition: Partition,
    pub disposition: Disposition,
    /// Tables snapshotted, in order, before anything is removed
    pub snapshots: Vec<String>,
    pub deletes: Vec<DeleteOp>,
    pub object_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionPlan {
    pub scope: DeletionScope,
    pub targets: DeletionTargets,
    pub partitions: Vec<PartitionPlan>,
}

impl DeletionPlan {
    pub fn to_delete(&self) -> impl Iterator<Item = &PartitionPlan> {
        self.partitions
            .iter()
            .filter(|p| p.disposition == Disposition::Delete)
    }

    pub fn held(&self) -> impl Iterator<Item = &PartitionPlan> {
        self.partitions
            .iter()
            .filter(|p| p.disposition == Disposition::Held)
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    Deleted,
    Partial,
    Failed,
    Held,
}

impl DeletionStatus {
    pub fn unit_status(self) -> UnitStatus {
        match self {
            DeletionStatus::Deleted => UnitStatus::Succeeded,
            DeletionStatus::Held => UnitStatus::Skipped,
            DeletionStatus::Partial => UnitStatus::Partial,
            DeletionStatus::Failed => UnitStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDeletion {
    pub lifecycle: TableLifecycle,
    pub snapshot: Option<SnapshotRecord>,
    pub rows_deleted: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDeletionReport {
    pub partition: Partition,
    pub status: DeletionStatus,
    pub tables: Vec<TableDeletion>,
    pub objects_removed: usize,
    pub object_error: Option<String>,
}

impl PartitionDeletionReport {
    pub fn table(&self, name: &str) -> Option<&TableDeletion> {
        self.tables.iter().find(|t| t.lifecycle.table == name)
    }
}

// ============================================================================
// DELETION ENGINE
// ============================================================================

pub struct DeletionEngine<'a> {
    config: &'a ArchiveConfig,
    objects: &'a dyn ObjectStore,
    warehouse: &'a dyn Warehouse,
    targets: DeletionTargets,
    as_of: NaiveDate,
}

impl<'a> DeletionEngine<'a> {
    pub fn new(
        config: &'a ArchiveConfig,
        objects: &'a dyn ObjectStore,
        warehouse: &'a dyn Warehouse,
    ) -> Self {
        DeletionEngine {
            config,
            objects,
            warehouse,
            targets: DeletionTargets::Both,
            as_of: Utc::now().date_naive(),
        }
    }

    pub fn with_targets(mut self, targets: DeletionTargets) -> Self {
        self.targets = targets;
        self
    }

    /// Evaluate the window as of another date than today
    pub fn as_of(mut self, date: NaiveDate) -> Self {
        self.as_of = date;
        self
    }

    pub fn window(&self, module: &ModuleConfig) -> RetentionWindow {
        RetentionWindow::as_of(
            self.config.calendar_for(module),
            self.config.retention_window_years,
            self.as_of,
        )
    }

    // ------------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------------

    /// Decide which partitions in scope are removed and which are held
    pub fn plan(&self, scope: &DeletionScope) -> ArchiveResult<DeletionPlan> {
        if let Some(name) = &scope.module {
            if self.config.module(name).is_none() {
                return Err(ArchiveError::NotFound(format!("module {}", name)));
            }
        }

        let mut partitions = Vec::new();
        for module in self.config.modules.iter().filter(|m| scope.includes_module(&m.name)) {
            let window = self.window(module);
            for tag in self.discover(module)? {
                if !scope.includes_tag(tag) || !self.is_eligible(window, scope, tag) {
                    continue;
                }
                partitions.push(self.plan_partition(module, tag)?);
            }
        }

        Ok(DeletionPlan {
            scope: scope.clone(),
            targets: self.targets,
            partitions,
        })
    }

    fn is_eligible(&self, window: RetentionWindow, scope: &DeletionScope, tag: FiscalYearTag) -> bool {
        if tag.is_orphan() {
            // Orphans only go by explicit operator action
            return scope.forces(tag);
        }
        window.is_expired(tag) || scope.forces(tag)
    }

    /// Partitions present in either store for a module
    fn discover(&self, module: &ModuleConfig) -> ArchiveResult<BTreeSet<FiscalYearTag>> {
        let mut tags = BTreeSet::new();
        for table in module.tables() {
            let found = retry_transient(&self.config.retry, "list partitions", || {
                self.warehouse.partitions(table)
            })?;
            tags.extend(found);
        }

        let prefix = module_prefix(&self.config.object_root, &module.name);
        let objects = retry_transient(&self.config.retry, "list objects", || {
            self.objects.list(&prefix)
        })?;
        for object in objects {
            let year = object
                .path
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split('/').next())
                .and_then(|folder| folder.strip_prefix("FY"))
                .and_then(|year| year.parse::<i32>().ok());
            if let Some(year) = year {
                tags.insert(FiscalYearTag::from_value(year));
            }
        }
        Ok(tags)
    }

    fn plan_partition(&self, module: &ModuleConfig, tag: FiscalYearTag) -> ArchiveResult<PartitionPlan> {
        let partition = Partition::new(&module.name, tag);

        if is_under_hold(self.config, self.warehouse, &partition)? {
            return Ok(PartitionPlan {
                partition,
                disposition: Disposition::Held,
                snapshots: Vec::new(),
                deletes: Vec::new(),
                object_prefix: None,
            });
        }

        let mut tables = Vec::new();
        if self.targets.tables() {
            for table in module.tables() {
                let present = retry_transient(&self.config.retry, "list partitions", || {
                    self.warehouse.partitions(table)
                })?;
                if present.contains(&tag) {
                    tables.push(table.to_string());
                }
            }
        }

        let deletes = tables
            .iter()
            .map(|table| DeleteOp {
                table: table.clone(),
                predicate: format!("{} = {}", PARTITION_COLUMN, tag.value()),
            })
            .collect();
        let object_prefix = self
            .targets
            .objects()
            .then(|| partition.prefix(&self.config.object_root));

        Ok(PartitionPlan {
            partition,
            disposition: Disposition::Delete,
            snapshots: tables,
            deletes,
            object_prefix,
        })
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    pub fn execute(&self, plan: &DeletionPlan) -> Vec<PartitionDeletionReport> {
        plan.partitions
            .iter()
            .map(|partition| self.execute_partition(partition))
            .collect()
    }

    /// Snapshot every table, then remove rows and objects
    pub fn execute_partition(&self, plan: &PartitionPlan) -> PartitionDeletionReport {
        let partition = &plan.partition;
        let mut report = PartitionDeletionReport {
            partition: partition.clone(),
            status: DeletionStatus::Failed,
            tables: Vec::new(),
            objects_removed: 0,
            object_error: None,
        };

        if plan.disposition == Disposition::Held {
            info!(partition = %partition, "Partition under legal hold, not deleted");
            report.status = DeletionStatus::Held;
            return report;
        }

        let expires_at = Utc::now() + Duration::days(self.config.snapshot_expiration_days);
        let mut snapshot_failed = false;
        for table in &plan.snapshots {
            let mut lifecycle = TableLifecycle::new(table);
            let mut entry = TableDeletion {
                lifecycle: lifecycle.clone(),
                snapshot: None,
                rows_deleted: 0,
                error: None,
            };
            let outcome = lifecycle
                .advance(DeletionState::Eligible)
                .and_then(|_| lifecycle.advance(DeletionState::Snapshotting))
                .and_then(|_| {
                    retry_transient(&self.config.retry, "create snapshot", || {
                        self.warehouse
                            .create_snapshot(&partition.module, table, partition.tag, expires_at)
                    })
                });
            match outcome {
                Ok(snapshot) => {
                    entry.snapshot = Some(snapshot);
                    let _ = lifecycle.advance(DeletionState::Snapshotted);
                }
                Err(e) => {
                    error!(partition = %partition, table = %table, error = %e, "Snapshot failed");
                    entry.error = Some(e.to_string());
                    let _ = lifecycle.advance(DeletionState::SnapshotFailed);
                    snapshot_failed = true;
                }
            }
            entry.lifecycle = lifecycle;
            report.tables.push(entry);
        }

        if snapshot_failed {
            warn!(partition = %partition, "Deletion aborted, partition stays eligible");
            return report;
        }

        let mut failures = 0;
        let mut successes = 0;
        for entry in report.tables.iter_mut() {
            let table = entry.lifecycle.table.clone();
            if let Err(e) = entry.lifecycle.advance(DeletionState::Deleting) {
                entry.error = Some(e.to_string());
                failures += 1;
                continue;
            }
            match retry_transient(&self.config.retry, "delete partition rows", || {
                self.warehouse.delete_partition(&table, partition.tag)
            }) {
                Ok(rows) => {
                    entry.rows_deleted = rows;
                    let _ = entry.lifecycle.advance(DeletionState::Deleted);
                    successes += 1;
                }
                Err(e) => {
                    error!(partition = %partition, table = %table, error = %e, "Row deletion failed");
                    entry.error = Some(e.to_string());
                    let _ = entry.lifecycle.advance(DeletionState::DeleteFailed);
                    failures += 1;
                }
            }
        }

        if let Some(prefix) = &plan.object_prefix {
            match retry_transient(&self.config.retry, "delete objects", || {
                self.objects.delete_prefix(prefix)
            }) {
                Ok(removed) => {
                    report.objects_removed = removed;
                    successes += 1;
                }
                Err(e) => {
                    error!(partition = %partition, prefix = %prefix, error = %e, "Object removal failed");
                    report.object_error = Some(e.to_string());
                    failures += 1;
                }
            }
        }

        report.status = match (successes, failures) {
            (_, 0) => DeletionStatus::Deleted,
            (0, _) => DeletionStatus::Failed,
            _ => DeletionStatus::Partial,
        };
        info!(
            partition = %partition,
            status = ?report.status,
            rows = report.tables.iter().map(|t| t.rows_deleted).sum::<u64>(),
            objects = report.objects_removed,
            "Partition retention complete"
        );
        report
    }
}

/// Scope for an operator-driven orphan purge
pub fn orphan_scope(module: impl Into<String>) -> DeletionScope {
    DeletionScope {
        module: Some(module.into()),
        fiscal_year: Some(ORPHAN_FISCAL_YEAR),
        force: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::object_store::{MemoryObjectStore, ObjectMeta};
    use crate::warehouse::SqliteWarehouse;
    use chrono::DateTime;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cols() -> Vec<String> {
        vec!["JOURNAL_ID".to_string()]
    }

    /// Warehouse and bucket holding GL partitions 2016, 2017, 2018 and orphan
    fn seeded() -> (SqliteWarehouse, MemoryObjectStore) {
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        let objects = MemoryObjectStore::new();
        for table in ["JRNL_HDR", "JRNL_LN"] {
            warehouse.ensure_table(table, &cols()).unwrap();
            for tag in [
                FiscalYearTag::Year(2016),
                FiscalYearTag::Year(2017),
                FiscalYearTag::Year(2018),
                FiscalYearTag::Orphan,
            ] {
                warehouse
                    .append_rows(table, &cols(), tag, &[vec![Value::from("J1")], vec![Value::from("J2")]])
                    .unwrap();
                let path = format!("finsup/GL/{}/{}_{}.00000.csv", tag.folder(), table, tag.value());
                objects.put(&path, b"JOURNAL_ID,fy_partition\n").unwrap();
            }
        }
        (warehouse, objects)
    }

    fn years(plan: &DeletionPlan, disposition: Disposition) -> Vec<i32> {
        plan.partitions
            .iter()
            .filter(|p| p.disposition == disposition)
            .map(|p| p.partition.tag.value())
            .collect()
    }

    #[test]
    fn test_window_boundaries() {
        let window = RetentionWindow {
            current_fiscal_year: 2025,
            window_years: 7,
        };
        assert!(window.is_expired(FiscalYearTag::Year(2017)));
        assert!(!window.is_expired(FiscalYearTag::Year(2018)));
        assert!(!window.is_expired(FiscalYearTag::Orphan));

        let july = RetentionWindow::as_of(FiscalCalendar::new(7), 7, date(2024, 7, 1));
        assert_eq!(july.current_fiscal_year, 2025);
    }

    #[test]
    fn test_state_machine_rejects_illegal_transitions() {
        let mut lifecycle = TableLifecycle::new("JRNL_LN");
        assert!(lifecycle.advance(DeletionState::Deleting).is_err());
        lifecycle.advance(DeletionState::Eligible).unwrap();
        assert!(lifecycle.advance(DeletionState::Deleted).is_err());
        lifecycle.advance(DeletionState::Held).unwrap();
        assert!(lifecycle.state().is_terminal());
        assert!(lifecycle.advance(DeletionState::Snapshotting).is_err());
        assert_eq!(
            lifecycle.history,
            vec![DeletionState::Active, DeletionState::Eligible, DeletionState::Held]
        );
    }

    #[test]
    fn test_plan_respects_window_and_holds() {
        let config = sample_config(); // window 7, GL 2016 held in config
        let (warehouse, objects) = seeded();
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let plan = engine.plan(&DeletionScope::default()).unwrap();

        assert_eq!(years(&plan, Disposition::Delete), vec![2017]);
        assert_eq!(years(&plan, Disposition::Held), vec![2016]);

        let fy2017 = plan.to_delete().next().unwrap();
        assert_eq!(fy2017.snapshots, vec!["JRNL_HDR", "JRNL_LN"]);
        assert_eq!(fy2017.deletes[0].predicate, "fy_partition = 2017");
        assert_eq!(fy2017.object_prefix.as_deref(), Some("finsup/GL/FY2017/"));
    }

    #[test]
    fn test_registry_hold_blocks_deletion() {
        let config = sample_config();
        let (warehouse, objects) = seeded();
        warehouse.place_hold("GL", 2017, "audit request").unwrap();
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        assert_eq!(plan.to_delete().count(), 0);
        assert_eq!(years(&plan, Disposition::Held), vec![2016, 2017]);

        // Force bypasses age, never a hold
        let forced = engine
            .plan(&DeletionScope {
                module: Some("GL".to_string()),
                fiscal_year: Some(2017),
                force: true,
            })
            .unwrap();
        assert_eq!(years(&forced, Disposition::Held), vec![2017]);
    }

    #[test]
    fn test_dry_run_plan_matches_execution() {
        let config = sample_config();
        let (warehouse, objects) = seeded();
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let preview = engine.plan(&DeletionScope::default()).unwrap();
        // Dry run changes nothing
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 2);

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        assert_eq!(preview, plan);

        let reports = engine.execute(&plan);
        let fy2017 = reports
            .iter()
            .find(|r| r.partition.tag == FiscalYearTag::Year(2017))
            .unwrap();
        assert_eq!(fy2017.status, DeletionStatus::Deleted);
        assert_eq!(fy2017.objects_removed, 2);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 0);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2018)).unwrap(), 2);
        assert!(objects.list("finsup/GL/FY2017/").unwrap().is_empty());
        assert_eq!(objects.list("finsup/GL/FY2016/").unwrap().len(), 2);

        let held = reports
            .iter()
            .find(|r| r.partition.tag == FiscalYearTag::Year(2016))
            .unwrap();
        assert_eq!(held.status, DeletionStatus::Held);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2016)).unwrap(), 2);
    }

    #[test]
    fn test_every_table_snapshotted_before_delete() {
        let config = sample_config();
        let (warehouse, objects) = seeded();
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        let report = engine.execute_partition(plan.to_delete().next().unwrap());

        for table in &report.tables {
            assert!(table
                .lifecycle
                .reached_before(DeletionState::Snapshotted, DeletionState::Deleting));
            assert_eq!(table.lifecycle.state(), DeletionState::Deleted);
            let snapshot = table.snapshot.as_ref().unwrap();
            assert_eq!(snapshot.row_count, 2);
            assert!(warehouse.table_exists(&snapshot.snapshot_table).unwrap());
        }
        assert_eq!(warehouse.snapshots().unwrap().len(), 2);
    }

    #[test]
    fn test_orphan_requires_explicit_force() {
        let config = sample_config();
        let (warehouse, objects) = seeded();
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2125, 3, 1));

        // A century later the orphan partition is still not eligible by age
        let plan = engine.plan(&DeletionScope::default()).unwrap();
        assert!(!plan.partitions.iter().any(|p| p.partition.is_orphan()));

        let unforced = engine
            .plan(&DeletionScope {
                fiscal_year: Some(ORPHAN_FISCAL_YEAR),
                ..DeletionScope::default()
            })
            .unwrap();
        assert!(unforced.partitions.is_empty());

        let forced = engine.plan(&orphan_scope("GL")).unwrap();
        assert_eq!(years(&forced, Disposition::Delete), vec![ORPHAN_FISCAL_YEAR]);
    }

    #[test]
    fn test_targets_toggle() {
        let config = sample_config();
        let (warehouse, objects) = seeded();
        let engine = DeletionEngine::new(&config, &objects, &warehouse)
            .as_of(date(2025, 3, 1))
            .with_targets(DeletionTargets::ObjectsOnly);

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        let fy2017 = plan.to_delete().next().unwrap();
        assert!(fy2017.snapshots.is_empty());

        let report = engine.execute_partition(fy2017);
        assert_eq!(report.status, DeletionStatus::Deleted);
        assert!(objects.list("finsup/GL/FY2017/").unwrap().is_empty());
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 2);
    }

    /// Delegates to SQLite but fails chosen operations
    struct FlakyWarehouse {
        inner: SqliteWarehouse,
        snapshot_fails_for: Option<&'static str>,
        delete_fails_for: Option<&'static str>,
    }

    impl Warehouse for FlakyWarehouse {
        fn table_exists(&self, table: &str) -> ArchiveResult<bool> {
            self.inner.table_exists(table)
        }
        fn ensure_table(&self, table: &str, columns: &[String]) -> ArchiveResult<()> {
            self.inner.ensure_table(table, columns)
        }
        fn append_rows(
            &self,
            table: &str,
            columns: &[String],
            tag: FiscalYearTag,
            rows: &[Vec<Value>],
        ) -> ArchiveResult<u64> {
            self.inner.append_rows(table, columns, tag, rows)
        }
        fn delete_partition(&self, table: &str, tag: FiscalYearTag) -> ArchiveResult<u64> {
            if self.delete_fails_for == Some(table) {
                return Err(ArchiveError::NotFound(format!("{} permission denied", table)));
            }
            self.inner.delete_partition(table, tag)
        }
        fn count_partition(&self, table: &str, tag: FiscalYearTag) -> ArchiveResult<u64> {
            self.inner.count_partition(table, tag)
        }
        fn partitions(&self, table: &str) -> ArchiveResult<Vec<FiscalYearTag>> {
            self.inner.partitions(table)
        }
        fn create_snapshot(
            &self,
            module: &str,
            table: &str,
            tag: FiscalYearTag,
            expires_at: DateTime<Utc>,
        ) -> ArchiveResult<SnapshotRecord> {
            if self.snapshot_fails_for == Some(table) {
                return Err(ArchiveError::Snapshot {
                    table: table.to_string(),
                    fiscal_year: tag.value(),
                    message: "quota exceeded".to_string(),
                });
            }
            self.inner.create_snapshot(module, table, tag, expires_at)
        }
        fn is_held(&self, partition: &Partition) -> ArchiveResult<bool> {
            self.inner.is_held(partition)
        }
        fn record_manifest(&self, entry: &crate::warehouse::ManifestEntry) -> ArchiveResult<()> {
            self.inner.record_manifest(entry)
        }
    }

    #[test]
    fn test_snapshot_failure_aborts_partition() {
        let config = sample_config();
        let (inner, objects) = seeded();
        let warehouse = FlakyWarehouse {
            inner,
            snapshot_fails_for: Some("JRNL_LN"),
            delete_fails_for: None,
        };
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        let report = engine.execute_partition(plan.to_delete().next().unwrap());

        assert_eq!(report.status, DeletionStatus::Failed);
        assert_eq!(
            report.table("JRNL_LN").unwrap().lifecycle.state(),
            DeletionState::SnapshotFailed
        );
        // Nothing removed anywhere, not even for the table whose snapshot worked
        assert_eq!(warehouse.count_partition("JRNL_HDR", FiscalYearTag::Year(2017)).unwrap(), 2);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 2);
        assert_eq!(objects.list("finsup/GL/FY2017/").unwrap().len(), 2);
    }

    #[test]
    fn test_table_failure_is_partial() {
        let config = sample_config();
        let (inner, objects) = seeded();
        let warehouse = FlakyWarehouse {
            inner,
            snapshot_fails_for: None,
            delete_fails_for: Some("JRNL_LN"),
        };
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        let report = engine.execute_partition(plan.to_delete().next().unwrap());

        assert_eq!(report.status, DeletionStatus::Partial);
        assert_eq!(report.status.unit_status(), UnitStatus::Partial);
        assert_eq!(report.table("JRNL_HDR").unwrap().lifecycle.state(), DeletionState::Deleted);
        assert_eq!(
            report.table("JRNL_LN").unwrap().lifecycle.state(),
            DeletionState::DeleteFailed
        );
        assert_eq!(warehouse.count_partition("JRNL_HDR", FiscalYearTag::Year(2017)).unwrap(), 0);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 2);
        assert!(objects.list("finsup/GL/FY2017/").unwrap().is_empty());
    }

    /// Bucket whose prefix removal fails until switched back on
    struct FlakyBucket {
        inner: MemoryObjectStore,
        refuse_deletes: AtomicBool,
    }

    impl ObjectStore for FlakyBucket {
        fn put(&self, path: &str, data: &[u8]) -> ArchiveResult<ObjectMeta> {
            self.inner.put(path, data)
        }

        fn get(&self, path: &str) -> ArchiveResult<Vec<u8>> {
            self.inner.get(path)
        }

        fn head(&self, path: &str) -> ArchiveResult<Option<ObjectMeta>> {
            self.inner.head(path)
        }

        fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectMeta>> {
            self.inner.list(prefix)
        }

        fn delete(&self, path: &str) -> ArchiveResult<()> {
            if self.refuse_deletes.load(AtomicOrdering::SeqCst) {
                return Err(ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "bucket policy denies delete",
                )));
            }
            self.inner.delete(path)
        }
    }

    #[test]
    fn test_object_failure_is_partial_then_completes() {
        let config = sample_config();
        let (warehouse, inner) = seeded();
        let objects = FlakyBucket {
            inner,
            refuse_deletes: AtomicBool::new(true),
        };
        let engine = DeletionEngine::new(&config, &objects, &warehouse).as_of(date(2025, 3, 1));

        let plan = engine.plan(&DeletionScope::default()).unwrap();
        let report = engine.execute_partition(plan.to_delete().next().unwrap());

        // Rows went, objects stayed
        assert_eq!(report.status, DeletionStatus::Partial);
        assert_eq!(report.status.unit_status(), UnitStatus::Partial);
        assert!(report.object_error.is_some());
        assert_eq!(report.objects_removed, 0);
        assert!(report
            .tables
            .iter()
            .all(|t| t.lifecycle.state() == DeletionState::Deleted));
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 0);
        assert_eq!(objects.list("finsup/GL/FY2017/").unwrap().len(), 2);

        // Next run finds the leftover objects and finishes the job
        objects.refuse_deletes.store(false, AtomicOrdering::SeqCst);
        let plan = engine.plan(&DeletionScope::default()).unwrap();
        let retry = plan.to_delete().next().unwrap();
        assert_eq!(retry.partition.tag, FiscalYearTag::Year(2017));
        assert!(retry.deletes.is_empty());

        let report = engine.execute_partition(retry);
        assert_eq!(report.status, DeletionStatus::Deleted);
        assert_eq!(report.objects_removed, 2);
        assert!(report.object_error.is_none());
        assert!(objects.list("finsup/GL/FY2017/").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_module_scope() {
        let config = sample_config();
        let (warehouse, objects) = seeded();
        let engine = DeletionEngine::new(&config, &objects, &warehouse);
        assert!(engine
            .plan(&DeletionScope {
                module: Some("AP".to_string()),
                ..DeletionScope::default()
            })
            .is_err());
    }
}
