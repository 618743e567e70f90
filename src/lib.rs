// Fiscal-Year Archive - Core Library
// Exposes all modules for use in the CLI, the audit API server, and tests

pub mod error;
pub mod config;
pub mod fiscal;          // Fiscal calendar + orphan sentinel
pub mod source;          // Operational store (read side)
pub mod resolver;        // Fiscal Year Resolver
pub mod tagger;          // Cross-Table Tagger
pub mod object_store;    // Year-scoped object storage
pub mod warehouse;       // Queryable archive + bookkeeping tables
pub mod writer;          // Partitioned Writer
pub mod retention;       // Retention Deletion Engine
pub mod alerts;
pub mod reconciliation;  // Reconciliation Engine
pub mod workers;         // Bounded worker pool, retry, cancellation
pub mod pipeline;        // Sweep orchestration
pub mod report;          // Archive layout report

// Re-export commonly used types
pub use error::{ArchiveError, ArchiveResult};
pub use config::{ArchiveConfig, ModuleConfig, LegalHoldConfig, RetryConfig, StoragePaths};
pub use fiscal::{
    FiscalCalendar, FiscalYearTag, Partition, DateBounds,
    ORPHAN_FISCAL_YEAR,
};
pub use source::{BusinessKey, SourceStore, SqliteSource, TableBatch};
pub use resolver::{FiscalYearResolver, ResolvedKeys};
pub use tagger::{CrossTableTagger, TaggedBatch};
pub use object_store::{ObjectStore, LocalObjectStore, MemoryObjectStore, ObjectMeta};
pub use warehouse::{
    Warehouse, SqliteWarehouse, SnapshotRecord, ManifestEntry, LegalHold, AuditQuery,
};
pub use writer::{PartitionedWriter, TableWriteReport};
pub use retention::{
    DeletionEngine, DeletionPlan, DeletionScope, DeletionState, DeletionStatus,
    DeletionTargets, PartitionDeletionReport, RetentionWindow,
};
pub use alerts::{
    AlertEvent, AlertSink, Severity,
    LogAlertSink, JsonlAlertSink, MemoryAlertSink, FanoutAlertSink,
};
pub use reconciliation::{
    AuditSink, ReconciliationEngine, ReconciliationRecord, PartitionReconciliation, Thresholds,
};
pub use workers::{CancelToken, UnitStatus, WorkerPool};
pub use pipeline::{Phases, Stores, Sweep, SweepOptions, SweepReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
