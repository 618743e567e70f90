// Warehouse - queryable representation of every archived partition
//
// Each archived table carries an integer `fy_partition` column; retention
// deletes by that predicate and reconciliation counts by it. The same SQLite
// database also hosts the bookkeeping tables: archive manifest, snapshot
// registry, legal hold registry and the reconciliation audit trail.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::alerts::Severity;
use crate::config::PARTITION_COLUMN;
use crate::error::{ArchiveError, ArchiveResult};
use crate::fiscal::{FiscalYearTag, Partition};
use crate::reconciliation::ReconciliationRecord;

/// Bookkeeping tables an archived table may never be named after
pub const RESERVED_TABLES: [&str; 4] = [
    "archive_manifest",
    "archive_snapshots",
    "legal_holds",
    "reconciliation_audit",
];

/// Prefix of the point-in-time copies created before deletion
pub const SNAPSHOT_PREFIX: &str = "snap_";

// ============================================================================
// RECORDS
// ============================================================================

/// Point-in-time copy of one table's partition, taken before deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub module: String,
    pub table: String,
    pub fiscal_year: i32,
    pub snapshot_table: String,
    pub row_count: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What the writer last produced for a (table, partition)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub module: String,
    pub table: String,
    pub fiscal_year: i32,
    pub row_count: u64,
    pub chunk_count: usize,
    /// SHA-256 over the ordered chunk checksums
    pub digest: String,
    pub run_id: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegalHold {
    pub module: String,
    pub fiscal_year: i32,
    pub reason: String,
    pub placed_at: DateTime<Utc>,
}

/// Filter for the reconciliation audit trail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub module: Option<String>,
    pub fiscal_year: Option<i32>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ============================================================================
// WAREHOUSE CONTRACT
// ============================================================================

pub trait Warehouse: Send + Sync {
    fn table_exists(&self, table: &str) -> ArchiveResult<bool>;

    /// Create the table with the given business columns plus `fy_partition`
    fn ensure_table(&self, table: &str, columns: &[String]) -> ArchiveResult<()>;

    /// Append rows to one partition of a table in a single transaction
    fn append_rows(
        &self,
        table: &str,
        columns: &[String],
        tag: FiscalYearTag,
        rows: &[Vec<Value>],
    ) -> ArchiveResult<u64>;

    /// `DELETE FROM <table> WHERE fy_partition = <year>`; 0 when the table is absent
    fn delete_partition(&self, table: &str, tag: FiscalYearTag) -> ArchiveResult<u64>;

    fn count_partition(&self, table: &str, tag: FiscalYearTag) -> ArchiveResult<u64>;

    /// Distinct tags present in a table
    fn partitions(&self, table: &str) -> ArchiveResult<Vec<FiscalYearTag>>;

    fn create_snapshot(
        &self,
        module: &str,
        table: &str,
        tag: FiscalYearTag,
        expires_at: DateTime<Utc>,
    ) -> ArchiveResult<SnapshotRecord>;

    /// Holds placed through the registry (configured holds are checked separately)
    fn is_held(&self, partition: &Partition) -> ArchiveResult<bool>;

    fn record_manifest(&self, entry: &ManifestEntry) -> ArchiveResult<()>;
}

// ============================================================================
// SQLITE WAREHOUSE
// ============================================================================

pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl SqliteWarehouse {
    pub fn open(path: &Path) -> ArchiveResult<Self> {
        let conn = Connection::open(path)?;
        // WAL lets reconciliation read while the writer appends
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> ArchiveResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> ArchiveResult<Self> {
        setup_bookkeeping(&conn)?;
        Ok(SqliteWarehouse {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> ArchiveResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ArchiveError::transient("warehouse lock", "connection mutex poisoned"))
    }

    // ------------------------------------------------------------------------
    // Legal holds
    // ------------------------------------------------------------------------

    pub fn place_hold(&self, module: &str, fiscal_year: i32, reason: &str) -> ArchiveResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO legal_holds (module, fiscal_year, reason, placed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![module, fiscal_year, reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn release_hold(&self, module: &str, fiscal_year: i32) -> ArchiveResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM legal_holds WHERE module = ?1 AND fiscal_year = ?2",
            params![module, fiscal_year],
        )?;
        Ok(removed > 0)
    }

    pub fn list_holds(&self) -> ArchiveResult<Vec<LegalHold>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT module, fiscal_year, reason, placed_at FROM legal_holds
             ORDER BY module, fiscal_year",
        )?;
        let holds = stmt
            .query_map([], |row| {
                Ok(LegalHold {
                    module: row.get(0)?,
                    fiscal_year: row.get(1)?,
                    reason: row.get(2)?,
                    placed_at: parse_time(3, row.get(3)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holds)
    }

    // ------------------------------------------------------------------------
    // Manifest
    // ------------------------------------------------------------------------

    pub fn manifest(&self, module: &str) -> ArchiveResult<Vec<ManifestEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT module, table_name, fiscal_year, row_count, chunk_count, digest, run_id, written_at
             FROM archive_manifest WHERE module = ?1
             ORDER BY table_name, fiscal_year",
        )?;
        let entries = stmt
            .query_map([module], |row| {
                Ok(ManifestEntry {
                    module: row.get(0)?,
                    table: row.get(1)?,
                    fiscal_year: row.get(2)?,
                    row_count: row.get::<_, i64>(3)?.max(0) as u64,
                    chunk_count: row.get::<_, i64>(4)?.max(0) as usize,
                    digest: row.get(5)?,
                    run_id: row.get(6)?,
                    written_at: parse_time(7, row.get(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub fn snapshots(&self) -> ArchiveResult<Vec<SnapshotRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, module, table_name, fiscal_year, snapshot_table,
                    row_count, created_at, expires_at
             FROM archive_snapshots ORDER BY created_at",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(SnapshotRecord {
                    snapshot_id: row.get(0)?,
                    module: row.get(1)?,
                    table: row.get(2)?,
                    fiscal_year: row.get(3)?,
                    snapshot_table: row.get(4)?,
                    row_count: row.get::<_, i64>(5)?.max(0) as u64,
                    created_at: parse_time(6, row.get(6)?)?,
                    expires_at: parse_time(7, row.get(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Drop snapshot copies whose expiration has passed
    pub fn purge_expired_snapshots(&self, now: DateTime<Utc>) -> ArchiveResult<usize> {
        let expired: Vec<SnapshotRecord> = self
            .snapshots()?
            .into_iter()
            .filter(|s| s.expires_at <= now)
            .collect();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for snapshot in &expired {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&snapshot.snapshot_table)))?;
            tx.execute(
                "DELETE FROM archive_snapshots WHERE snapshot_id = ?1",
                [&snapshot.snapshot_id],
            )?;
        }
        tx.commit()?;
        Ok(expired.len())
    }

    // ------------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------------

    pub fn reconciliations(&self, query: &AuditQuery) -> ArchiveResult<Vec<ReconciliationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, module, table_name, fiscal_year, source_count, target_count,
                    delta, pct, alerted, severity, reconciled_at
             FROM reconciliation_audit
             WHERE (?1 IS NULL OR module = ?1)
               AND (?2 IS NULL OR fiscal_year = ?2)
               AND (?3 IS NULL OR reconciled_at >= ?3)
             ORDER BY reconciled_at DESC, id DESC
             LIMIT ?4",
        )?;
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let since = query.since.map(|t| t.to_rfc3339());
        let records = stmt
            .query_map(
                params![query.module, query.fiscal_year, since, limit],
                |row| {
                    let severity: Option<String> = row.get(9)?;
                    Ok(ReconciliationRecord {
                        run_id: row.get(0)?,
                        module: row.get(1)?,
                        table: row.get(2)?,
                        fiscal_year: row.get(3)?,
                        source_count: row.get::<_, i64>(4)?.max(0) as u64,
                        target_count: row.get::<_, i64>(5)?.max(0) as u64,
                        delta: row.get(6)?,
                        pct: row.get(7)?,
                        alerted: row.get(8)?,
                        severity: severity.as_deref().and_then(Severity::parse),
                        reconciled_at: parse_time(10, row.get(10)?)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn append_reconciliation(&self, record: &ReconciliationRecord) -> ArchiveResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reconciliation_audit (
                run_id, module, table_name, fiscal_year, source_count, target_count,
                delta, pct, alerted, severity, reconciled_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.run_id,
                record.module,
                record.table,
                record.fiscal_year,
                record.source_count as i64,
                record.target_count as i64,
                record.delta,
                record.pct,
                record.alerted,
                record.severity.map(|s| s.as_str()),
                record.reconciled_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn setup_bookkeeping(conn: &Connection) -> ArchiveResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS archive_manifest (
            module TEXT NOT NULL,
            table_name TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            row_count INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            digest TEXT NOT NULL,
            run_id TEXT NOT NULL,
            written_at TEXT NOT NULL,
            PRIMARY KEY (module, table_name, fiscal_year)
        );

        CREATE TABLE IF NOT EXISTS archive_snapshots (
            snapshot_id TEXT PRIMARY KEY,
            module TEXT NOT NULL,
            table_name TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            snapshot_table TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS legal_holds (
            module TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            reason TEXT NOT NULL,
            placed_at TEXT NOT NULL,
            PRIMARY KEY (module, fiscal_year)
        );

        CREATE TABLE IF NOT EXISTS reconciliation_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            module TEXT NOT NULL,
            table_name TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            source_count INTEGER NOT NULL,
            target_count INTEGER NOT NULL,
            delta INTEGER NOT NULL,
            pct REAL,
            alerted INTEGER NOT NULL,
            severity TEXT,
            reconciled_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_partition
            ON reconciliation_audit(module, fiscal_year, reconciled_at);",
    )?;
    Ok(())
}

fn table_exists_on(conn: &Connection, table: &str) -> ArchiveResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

impl Warehouse for SqliteWarehouse {
    fn table_exists(&self, table: &str) -> ArchiveResult<bool> {
        let conn = self.lock()?;
        table_exists_on(&conn, table)
    }

    fn ensure_table(&self, table: &str, columns: &[String]) -> ArchiveResult<()> {
        let conn = self.lock()?;
        let mut definition: Vec<String> = columns
            .iter()
            .filter(|c| !c.eq_ignore_ascii_case(PARTITION_COLUMN))
            .map(|c| quote(c))
            .collect();
        definition.push(format!("{} INTEGER NOT NULL", PARTITION_COLUMN));

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns});
             CREATE INDEX IF NOT EXISTS {index} ON {table}({partition});",
            table = quote(table),
            columns = definition.join(", "),
            index = quote(&format!("idx_{}_{}", table, PARTITION_COLUMN)),
            partition = PARTITION_COLUMN,
        ))?;
        Ok(())
    }

    fn append_rows(
        &self,
        table: &str,
        columns: &[String],
        tag: FiscalYearTag,
        rows: &[Vec<Value>],
    ) -> ArchiveResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
            names.push(PARTITION_COLUMN.to_string());
            let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                names.join(", "),
                placeholders.join(", ")
            ))?;

            for row in rows {
                let mut values: Vec<SqlValue> = row.iter().map(to_sql_value).collect();
                values.push(SqlValue::Integer(i64::from(tag.value())));
                stmt.execute(rusqlite::params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    fn delete_partition(&self, table: &str, tag: FiscalYearTag) -> ArchiveResult<u64> {
        let conn = self.lock()?;
        if !table_exists_on(&conn, table)? {
            return Ok(0);
        }
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", quote(table), PARTITION_COLUMN),
            [tag.value()],
        )?;
        conn.execute(
            "DELETE FROM archive_manifest WHERE table_name = ?1 AND fiscal_year = ?2",
            params![table, tag.value()],
        )?;
        Ok(deleted as u64)
    }

    fn count_partition(&self, table: &str, tag: FiscalYearTag) -> ArchiveResult<u64> {
        let conn = self.lock()?;
        if !table_exists_on(&conn, table)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {} = ?1", quote(table), PARTITION_COLUMN),
            [tag.value()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn partitions(&self, table: &str) -> ArchiveResult<Vec<FiscalYearTag>> {
        let conn = self.lock()?;
        if !table_exists_on(&conn, table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {col} FROM {table} ORDER BY {col}",
            col = PARTITION_COLUMN,
            table = quote(table)
        ))?;
        let tags = stmt
            .query_map([], |row| row.get::<_, i32>(0))?
            .map(|year| year.map(FiscalYearTag::from_value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    fn create_snapshot(
        &self,
        module: &str,
        table: &str,
        tag: FiscalYearTag,
        expires_at: DateTime<Utc>,
    ) -> ArchiveResult<SnapshotRecord> {
        let snapshot_failed = |message: String| ArchiveError::Snapshot {
            table: table.to_string(),
            fiscal_year: tag.value(),
            message,
        };

        let mut conn = self.lock()?;
        if !table_exists_on(&conn, table)? {
            return Err(snapshot_failed("table does not exist".to_string()));
        }

        let created_at = Utc::now();
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let snapshot_table = format!(
            "{}{}_{}_{}_{}",
            SNAPSHOT_PREFIX,
            table,
            tag.value(),
            created_at.format("%Y%m%d%H%M%S"),
            &snapshot_id[..8]
        );

        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE {} AS SELECT * FROM {} WHERE {} = {}",
            quote(&snapshot_table),
            quote(table),
            PARTITION_COLUMN,
            tag.value()
        ))?;
        let row_count: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&snapshot_table)),
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO archive_snapshots (
                snapshot_id, module, table_name, fiscal_year, snapshot_table,
                row_count, created_at, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot_id,
                module,
                table,
                tag.value(),
                snapshot_table,
                row_count,
                created_at.to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(SnapshotRecord {
            snapshot_id,
            module: module.to_string(),
            table: table.to_string(),
            fiscal_year: tag.value(),
            snapshot_table,
            row_count: row_count.max(0) as u64,
            created_at,
            expires_at,
        })
    }

    fn is_held(&self, partition: &Partition) -> ArchiveResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM legal_holds WHERE module = ?1 AND fiscal_year = ?2",
                params![partition.module, partition.tag.value()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_manifest(&self, entry: &ManifestEntry) -> ArchiveResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO archive_manifest (
                module, table_name, fiscal_year, row_count, chunk_count, digest, run_id, written_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.module,
                entry.table,
                entry.fiscal_year,
                entry.row_count as i64,
                entry.chunk_count as i64,
                entry.digest,
                entry.run_id,
                entry.written_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
