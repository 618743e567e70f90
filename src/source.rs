// Operational Store - read side of the archive
//
// Rows leave the operational database as loosely typed values; the only
// transformation applied is the coercion needed to serialize them (SQLite
// storage classes -> JSON values).

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{ArchiveError, ArchiveResult};

// ============================================================================
// BUSINESS KEY
// ============================================================================

/// Identity of a logical record, shared by every table of a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusinessKey(Vec<String>);

impl BusinessKey {
    pub fn new(parts: Vec<String>) -> Self {
        BusinessKey(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

/// Text form of a key column; null (or structured) values make no key
fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// TABLE BATCH
// ============================================================================

/// A bounded slice of one table's rows
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TableBatch {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        TableBatch {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    /// Positions of the key columns, or None when the table lacks one
    pub fn key_indexes(&self, key_columns: &[String]) -> Option<Vec<usize>> {
        key_columns
            .iter()
            .map(|column| self.column_index(column))
            .collect()
    }

    /// Business key of a row; None when any key column is null
    pub fn key_of(row: &[Value], indexes: &[usize]) -> Option<BusinessKey> {
        indexes
            .iter()
            .map(|&i| row.get(i).and_then(key_part))
            .collect::<Option<Vec<_>>>()
            .map(BusinessKey::new)
    }
}

// ============================================================================
// SOURCE STORE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub table: String,
    /// None reads every column
    pub columns: Option<Vec<String>>,
    pub order_by: Vec<String>,
    pub batch_rows: usize,
}

pub trait SourceStore: Send + Sync {
    /// Stream a table in batches of at most `batch_rows` rows, in a stable order
    fn scan(
        &self,
        request: &ScanRequest,
        visit: &mut dyn FnMut(TableBatch) -> ArchiveResult<()>,
    ) -> ArchiveResult<()>;

    fn row_count(&self, table: &str) -> ArchiveResult<u64>;

    /// Column names in table order
    fn columns(&self, table: &str) -> ArchiveResult<Vec<String>>;
}

/// SQLite-backed operational store
pub struct SqliteSource {
    conn: Mutex<Connection>,
}

impl SqliteSource {
    pub fn open(path: &Path) -> ArchiveResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        SqliteSource {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> ArchiveResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ArchiveError::transient("source lock", "connection mutex poisoned"))
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Coerce one SQLite value into its serializable form
pub fn coerce_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
    }
}

impl SourceStore for SqliteSource {
    fn scan(
        &self,
        request: &ScanRequest,
        visit: &mut dyn FnMut(TableBatch) -> ArchiveResult<()>,
    ) -> ArchiveResult<()> {
        let conn = self.lock()?;

        let projection = match &request.columns {
            Some(columns) => columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            None => "*".to_string(),
        };
        let mut order: Vec<String> = request.order_by.iter().map(|c| quote(c)).collect();
        order.push("rowid".to_string());
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            projection,
            quote(&request.table),
            order.join(", ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let batch_rows = request.batch_rows.max(1);

        let mut rows = stmt.query([])?;
        let mut batch = TableBatch::new(&request.table, columns.clone());
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(coerce_value(row.get_ref(i)?));
            }
            batch.rows.push(values);

            if batch.len() >= batch_rows {
                let full = std::mem::replace(
                    &mut batch,
                    TableBatch::new(&request.table, columns.clone()),
                );
                visit(full)?;
            }
        }
        if !batch.is_empty() {
            visit(batch)?;
        }
        Ok(())
    }

    fn row_count(&self, table: &str) -> ArchiveResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn columns(&self, table: &str) -> ArchiveResult<Vec<String>> {
        let conn = self.lock()?;
        let stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 0", quote(table)))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        Ok(columns)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn gl_source() -> SqliteSource {
        SqliteSource::from_connection(gl_connection())
    }

    /// GL fixture: journal headers (date table) and journal lines
    pub(crate) fn gl_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE JRNL_HDR (
                BUSINESS_UNIT TEXT, JOURNAL_ID TEXT, ACCOUNTING_DT TEXT, DESCR TEXT
             );
             CREATE TABLE JRNL_LN (
                BUSINESS_UNIT TEXT, JOURNAL_ID TEXT, LINE_NBR INTEGER, AMOUNT REAL
             );
             CREATE TABLE JRNL_VAT (
                BUSINESS_UNIT TEXT, JOURNAL_ID TEXT, VAT_CODE TEXT
             );
             INSERT INTO JRNL_HDR VALUES
                ('US01', 'J1', '2016-03-01', 'opening'),
                ('US01', 'J1', '2015-12-30', 'reversal'),
                ('US01', 'J2', '2017-05-05', 'accrual'),
                ('US01', 'J3', 'garbage', 'bad date'),
                ('US01', 'J4', '2024-08-01', 'current'),
                ('US01', 'J5', NULL, 'no date');
             INSERT INTO JRNL_LN VALUES
                ('US01', 'J1', 1, 10.5),
                ('US01', 'J1', 2, -10.5),
                ('US01', 'J2', 1, 99.0),
                ('US01', 'J3', 1, 1.0),
                ('US01', 'J4', 1, 5.0),
                ('US01', 'J9', 1, 7.0),
                (NULL, 'J2', 3, 0.0);
             INSERT INTO JRNL_VAT VALUES
                ('US01', 'J2', 'V20');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_scan_batches_in_stable_order() {
        let source = gl_source();
        let request = ScanRequest {
            table: "JRNL_LN".to_string(),
            columns: None,
            order_by: vec!["BUSINESS_UNIT".to_string(), "JOURNAL_ID".to_string()],
            batch_rows: 3,
        };

        let mut sizes = Vec::new();
        let mut first_rows = Vec::new();
        source
            .scan(&request, &mut |batch| {
                sizes.push(batch.len());
                first_rows.push(batch.rows[0].clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(sizes, vec![3, 3, 1]);
        // NULL business unit sorts first in SQLite
        assert_eq!(first_rows[0][0], Value::Null);
        assert_eq!(source.row_count("JRNL_LN").unwrap(), 7);
        assert_eq!(
            source.columns("JRNL_LN").unwrap(),
            vec!["BUSINESS_UNIT", "JOURNAL_ID", "LINE_NBR", "AMOUNT"]
        );
    }

    #[test]
    fn test_key_extraction() {
        let batch = TableBatch {
            table: "JRNL_LN".to_string(),
            columns: vec!["business_unit".to_string(), "JOURNAL_ID".to_string()],
            rows: vec![
                vec![Value::from("US01"), Value::from("J1")],
                vec![Value::Null, Value::from("J1")],
                vec![Value::from("US01"), Value::from(42)],
            ],
        };
        let indexes = batch
            .key_indexes(&["BUSINESS_UNIT".to_string(), "JOURNAL_ID".to_string()])
            .unwrap();

        assert_eq!(
            TableBatch::key_of(&batch.rows[0], &indexes).unwrap().to_string(),
            "US01|J1"
        );
        assert!(TableBatch::key_of(&batch.rows[1], &indexes).is_none());
        assert_eq!(
            TableBatch::key_of(&batch.rows[2], &indexes).unwrap().parts()[1],
            "42"
        );
        assert!(batch.key_indexes(&["MISSING".to_string()]).is_none());
    }

    #[test]
    fn test_coerce_value() {
        assert_eq!(coerce_value(ValueRef::Null), Value::Null);
        assert_eq!(coerce_value(ValueRef::Integer(7)), Value::from(7));
        assert_eq!(coerce_value(ValueRef::Real(1.5)), Value::from(1.5));
        assert_eq!(coerce_value(ValueRef::Text(b"abc")), Value::from("abc"));
        assert_eq!(coerce_value(ValueRef::Blob(&[0xde, 0xad])), Value::from("dead"));
    }
}
