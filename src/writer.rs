// Partitioned Writer - tagged rows -> year-scoped object store + warehouse
//
// One call to `write_table` is one unit of work: a full, idempotent refresh of
// a single table's archive across every partition still inside the retention
// window (plus the orphan partition). Partitions already past the window are
// never recreated unless a legal hold keeps them.
//
// Pass 1 counts rows per tag so the exact artifact set of this run is known up
// front; stale artifacts are then removed once, before any write. Pass 2
// streams the table in key order, routing rows to per-partition buffers that
// flush in `chunk_rows` chunks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::config::{ArchiveConfig, ModuleConfig, PARTITION_COLUMN};
use crate::error::{ArchiveError, ArchiveResult};
use crate::fiscal::{module_prefix, FiscalYearTag, Partition};
use crate::object_store::{artifact_path, checksum, parse_artifact_name, ObjectStore};
use crate::resolver::ResolvedKeys;
use crate::retention::{is_under_hold, RetentionWindow};
use crate::source::{ScanRequest, SourceStore};
use crate::tagger::CrossTableTagger;
use crate::warehouse::{ManifestEntry, Warehouse};
use crate::workers::retry_transient;

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionWrite {
    pub fiscal_year: i32,
    pub rows: u64,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableWriteReport {
    pub module: String,
    pub table: String,
    pub partitions: Vec<PartitionWrite>,
    /// Rows belonging to unheld partitions already past the retention window
    pub expired_rows: u64,
    pub stale_artifacts_removed: usize,
    pub warehouse_rows_replaced: u64,
}

impl TableWriteReport {
    pub fn rows_written(&self) -> u64 {
        self.partitions.iter().map(|p| p.rows).sum()
    }

    pub fn chunks_written(&self) -> usize {
        self.partitions.iter().map(|p| p.chunks_written).sum()
    }

    pub fn chunks_skipped(&self) -> usize {
        self.partitions.iter().map(|p| p.chunks_skipped).sum()
    }
}

/// Serialize one chunk as CSV with the partition column appended
pub fn encode_chunk(columns: &[String], tag: FiscalYearTag, rows: &[Vec<Value>]) -> ArchiveResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header: Vec<&str> = columns.iter().map(String::as_str).collect();
    header.push(PARTITION_COLUMN);
    writer.write_record(&header)?;

    let year = tag.value().to_string();
    for row in rows {
        let mut record: Vec<String> = row.iter().map(field_text).collect();
        record.push(year.clone());
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|e| ArchiveError::Io(e.into_error()))
}

fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// PARTITION BUFFER
// ============================================================================

struct PartitionBuffer {
    rows: Vec<Vec<Value>>,
    next_chunk: usize,
    checksums: Vec<String>,
    report: PartitionWrite,
}

impl PartitionBuffer {
    fn new(tag: FiscalYearTag) -> Self {
        PartitionBuffer {
            rows: Vec::new(),
            next_chunk: 0,
            checksums: Vec::new(),
            report: PartitionWrite {
                fiscal_year: tag.value(),
                ..PartitionWrite::default()
            },
        }
    }

    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for sum in &self.checksums {
            hasher.update(sum.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// WRITABLE PARTITIONS
// ============================================================================

/// Partitions a run may write: inside the window, or past it but held
struct WritableTags<'w> {
    config: &'w ArchiveConfig,
    warehouse: &'w dyn Warehouse,
    window: RetentionWindow,
    module: &'w str,
    held: BTreeMap<FiscalYearTag, bool>,
}

impl<'w> WritableTags<'w> {
    fn allows(&mut self, tag: FiscalYearTag) -> ArchiveResult<bool> {
        if !self.window.is_expired(tag) {
            return Ok(true);
        }
        if let Some(held) = self.held.get(&tag) {
            return Ok(*held);
        }
        let held = is_under_hold(self.config, self.warehouse, &Partition::new(self.module, tag))?;
        if held {
            debug!(module = self.module, fiscal_year = tag.value(), "Held partition past the window is still archived");
        }
        self.held.insert(tag, held);
        Ok(held)
    }
}

// ============================================================================
// PARTITIONED WRITER
// ============================================================================

pub struct PartitionedWriter<'a> {
    config: &'a ArchiveConfig,
    source: &'a dyn SourceStore,
    objects: &'a dyn ObjectStore,
    warehouse: &'a dyn Warehouse,
    window: RetentionWindow,
    run_id: String,
}

impl<'a> PartitionedWriter<'a> {
    pub fn new(
        config: &'a ArchiveConfig,
        source: &'a dyn SourceStore,
        objects: &'a dyn ObjectStore,
        warehouse: &'a dyn Warehouse,
        window: RetentionWindow,
        run_id: impl Into<String>,
    ) -> Self {
        PartitionedWriter {
            config,
            source,
            objects,
            warehouse,
            window,
            run_id: run_id.into(),
        }
    }

    pub fn write_table(
        &self,
        module: &ModuleConfig,
        resolved: &ResolvedKeys,
        table: &str,
    ) -> ArchiveResult<TableWriteReport> {
        let tagger = CrossTableTagger::new(resolved, module);
        let chunk_rows = self.config.chunk_rows;
        let mut report = TableWriteReport {
            module: module.name.clone(),
            table: table.to_string(),
            ..TableWriteReport::default()
        };

        let mut writable = WritableTags {
            config: self.config,
            warehouse: self.warehouse,
            window: self.window,
            module: &module.name,
            held: BTreeMap::new(),
        };

        // Pass 1: how many rows land in each partition
        let counts = retry_transient(&self.config.retry, "count rows", || {
            tagger.count_table(self.source, table, chunk_rows)
        })?;
        let mut planned: BTreeMap<FiscalYearTag, usize> = BTreeMap::new();
        for (tag, rows) in &counts {
            if writable.allows(*tag)? {
                planned.insert(*tag, (*rows as usize).div_ceil(chunk_rows));
            } else {
                report.expired_rows += rows;
            }
        }
        if report.expired_rows > 0 {
            debug!(
                module = %module.name,
                table,
                rows = report.expired_rows,
                "Rows outside the retention window are not archived"
            );
        }

        let planned_paths: BTreeSet<String> = planned
            .iter()
            .flat_map(|(tag, chunks)| {
                let partition = Partition::new(&module.name, *tag);
                (0..*chunks)
                    .map(move |chunk| artifact_path(&self.config.object_root, &partition, table, chunk))
            })
            .collect();

        // Stale cleanup, once, before any write
        report.stale_artifacts_removed =
            self.remove_stale_artifacts(module, table, &planned_paths, &mut writable)?;
        report.warehouse_rows_replaced = self.clear_warehouse(table, &planned, &mut writable)?;

        // Pass 2: stream rows into partition buffers
        let columns = retry_transient(&self.config.retry, "read columns", || {
            self.source.columns(table)
        })?;
        retry_transient(&self.config.retry, "create warehouse table", || {
            self.warehouse.ensure_table(table, &columns)
        })?;

        let order_by: Vec<String> = module
            .key_columns
            .iter()
            .filter(|key| columns.iter().any(|c| c.eq_ignore_ascii_case(key)))
            .cloned()
            .collect();
        let request = ScanRequest {
            table: table.to_string(),
            columns: Some(columns.clone()),
            order_by,
            batch_rows: chunk_rows,
        };

        let mut buffers: BTreeMap<FiscalYearTag, PartitionBuffer> = BTreeMap::new();
        self.source.scan(&request, &mut |batch| {
            for (tag, rows) in tagger.tag(batch).into_partitions() {
                if !planned.contains_key(&tag) && !buffers.contains_key(&tag) {
                    if !writable.allows(tag)? {
                        report.expired_rows += rows.len() as u64;
                        continue;
                    }
                    warn!(module = %module.name, table, fiscal_year = tag.value(), "Partition appeared during write");
                }
                let buffer = buffers.entry(tag).or_insert_with(|| PartitionBuffer::new(tag));
                buffer.rows.extend(rows);
                while buffer.rows.len() >= chunk_rows {
                    let chunk: Vec<Vec<Value>> = buffer.rows.drain(..chunk_rows).collect();
                    self.flush_chunk(module, table, &columns, tag, buffer, chunk)?;
                }
            }
            Ok(())
        })?;

        for (tag, buffer) in buffers.iter_mut() {
            if !buffer.rows.is_empty() {
                let chunk = std::mem::take(&mut buffer.rows);
                self.flush_chunk(module, table, &columns, *tag, buffer, chunk)?;
            }
        }

        // Source shrank between passes: drop planned chunks that were never produced
        for (tag, chunks) in &planned {
            let produced = buffers.get(tag).map_or(0, |b| b.next_chunk);
            if produced < *chunks {
                warn!(module = %module.name, table, fiscal_year = tag.value(), planned = chunks, produced, "Source changed during write");
                let partition = Partition::new(&module.name, *tag);
                for chunk in produced..*chunks {
                    let path = artifact_path(&self.config.object_root, &partition, table, chunk);
                    retry_transient(&self.config.retry, "delete artifact", || self.objects.delete(&path))?;
                }
            }
        }

        for (tag, buffer) in buffers {
            let mut partition = buffer.report.clone();
            partition.digest = buffer.digest();
            let entry = ManifestEntry {
                module: module.name.clone(),
                table: table.to_string(),
                fiscal_year: tag.value(),
                row_count: partition.rows,
                chunk_count: buffer.next_chunk,
                digest: partition.digest.clone(),
                run_id: self.run_id.clone(),
                written_at: Utc::now(),
            };
            retry_transient(&self.config.retry, "record manifest", || {
                self.warehouse.record_manifest(&entry)
            })?;
            report.partitions.push(partition);
        }

        info!(
            module = %module.name,
            table,
            rows = report.rows_written(),
            written = report.chunks_written(),
            skipped = report.chunks_skipped(),
            stale = report.stale_artifacts_removed,
            "Table archived"
        );
        Ok(report)
    }

    fn flush_chunk(
        &self,
        module: &ModuleConfig,
        table: &str,
        columns: &[String],
        tag: FiscalYearTag,
        buffer: &mut PartitionBuffer,
        rows: Vec<Vec<Value>>,
    ) -> ArchiveResult<()> {
        let partition = Partition::new(&module.name, tag);
        let path = artifact_path(&self.config.object_root, &partition, table, buffer.next_chunk);
        let body = encode_chunk(columns, tag, &rows)?;
        let sum = checksum(&body);

        let existing = retry_transient(&self.config.retry, "head artifact", || self.objects.head(&path))?;
        // Same name and size is not enough: the checksum must match too
        let unchanged = existing.is_some_and(|meta| meta.size == body.len() as u64 && meta.checksum == sum);
        if unchanged {
            buffer.report.chunks_skipped += 1;
        } else {
            retry_transient(&self.config.retry, "put artifact", || self.objects.put(&path, &body))?;
            buffer.report.chunks_written += 1;
        }

        retry_transient(&self.config.retry, "append warehouse rows", || {
            self.warehouse.append_rows(table, columns, tag, &rows)
        })?;

        buffer.report.rows += rows.len() as u64;
        buffer.checksums.push(sum);
        buffer.next_chunk += 1;
        Ok(())
    }

    /// Delete this table's artifacts in writable partitions that this run will not produce
    fn remove_stale_artifacts(
        &self,
        module: &ModuleConfig,
        table: &str,
        planned_paths: &BTreeSet<String>,
        writable: &mut WritableTags<'_>,
    ) -> ArchiveResult<usize> {
        let prefix = module_prefix(&self.config.object_root, &module.name);
        let existing = retry_transient(&self.config.retry, "list artifacts", || {
            self.objects.list(&prefix)
        })?;

        let mut removed = 0;
        for object in existing {
            let Some((name, year, _)) = parse_artifact_name(&object.path) else {
                continue;
            };
            if name != table || planned_paths.contains(&object.path) {
                continue;
            }
            if !writable.allows(FiscalYearTag::from_value(year))? {
                continue;
            }
            retry_transient(&self.config.retry, "delete stale artifact", || {
                self.objects.delete(&object.path)
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Empty every writable partition of the table so the run replaces it
    fn clear_warehouse(
        &self,
        table: &str,
        planned: &BTreeMap<FiscalYearTag, usize>,
        writable: &mut WritableTags<'_>,
    ) -> ArchiveResult<u64> {
        let mut tags: BTreeSet<FiscalYearTag> = planned.keys().copied().collect();
        let present = retry_transient(&self.config.retry, "list partitions", || {
            self.warehouse.partitions(table)
        })?;
        for tag in present {
            if writable.allows(tag)? {
                tags.insert(tag);
            }
        }

        let mut cleared = 0;
        for tag in tags {
            cleared += retry_transient(&self.config.retry, "clear partition", || {
                self.warehouse.delete_partition(table, tag)
            })?;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::LegalHoldConfig;
    use crate::object_store::MemoryObjectStore;
    use crate::resolver::FiscalYearResolver;
    use crate::source::tests::{gl_connection, gl_source};
    use crate::source::{SqliteSource, TableBatch};
    use crate::warehouse::SqliteWarehouse;

    fn window() -> RetentionWindow {
        RetentionWindow {
            current_fiscal_year: 2025,
            window_years: 20,
        }
    }

    fn archive_lines(
        config: &ArchiveConfig,
        source: &SqliteSource,
        objects: &MemoryObjectStore,
        warehouse: &SqliteWarehouse,
        window: RetentionWindow,
    ) -> TableWriteReport {
        let module = &config.modules[0];
        let resolved = FiscalYearResolver::for_module(config, module)
            .resolve(source, module)
            .unwrap();
        PartitionedWriter::new(config, source, objects, warehouse, window, "run-test")
            .write_table(module, &resolved, "JRNL_LN")
            .unwrap()
    }

    #[test]
    fn test_rows_land_in_year_partitions() {
        let config = sample_config();
        let source = gl_source();
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();

        let report = archive_lines(&config, &source, &objects, &warehouse, window());

        assert_eq!(report.rows_written(), 7);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2015)).unwrap(), 2);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Orphan).unwrap(), 3);

        // chunk_rows = 2: FY2015 is exactly one chunk, orphan needs two
        let fy2015 = objects.list("finsup/GL/FY2015/").unwrap();
        assert_eq!(fy2015.len(), 1);
        assert_eq!(fy2015[0].path, "finsup/GL/FY2015/JRNL_LN_2015.00000.csv");
        assert_eq!(objects.list("finsup/GL/FY2099/").unwrap().len(), 2);

        let body = String::from_utf8(objects.get(&fy2015[0].path).unwrap()).unwrap();
        let mut reader = csv::Reader::from_reader(body.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.get(headers.len() - 1), Some("fy_partition"));
        assert_eq!(reader.records().count(), 2);
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let config = sample_config();
        let source = gl_source();
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();

        let first = archive_lines(&config, &source, &objects, &warehouse, window());
        let listing_before = objects.list("finsup/").unwrap();
        let second = archive_lines(&config, &source, &objects, &warehouse, window());
        let listing_after = objects.list("finsup/").unwrap();

        assert_eq!(second.chunks_written(), 0);
        assert_eq!(second.chunks_skipped(), first.chunks_written());
        assert_eq!(listing_before, listing_after);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Orphan).unwrap(), 3);
        assert_eq!(
            first.partitions.iter().map(|p| &p.digest).collect::<Vec<_>>(),
            second.partitions.iter().map(|p| &p.digest).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_changed_content_is_rewritten() {
        let config = sample_config();
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        archive_lines(&config, &gl_source(), &objects, &warehouse, window());

        // Same size, different bytes: 10.5 -> 11.5
        let conn = gl_connection();
        conn.execute("UPDATE JRNL_LN SET AMOUNT = 11.5 WHERE JOURNAL_ID = 'J1' AND LINE_NBR = 1", [])
            .unwrap();
        let source = SqliteSource::from_connection(conn);
        let report = archive_lines(&config, &source, &objects, &warehouse, window());

        let fy2015 = report.partitions.iter().find(|p| p.fiscal_year == 2015).unwrap();
        assert_eq!(fy2015.chunks_written, 1);
        assert_eq!(fy2015.chunks_skipped, 0);
    }

    #[test]
    fn test_stale_artifacts_removed() {
        let config = sample_config();
        let source = gl_source();
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();

        objects.put("finsup/GL/FY2015/JRNL_LN_2015.00007.csv", b"old").unwrap();
        objects.put("finsup/GL/FY2019/JRNL_LN_2019.00000.csv", b"moved away").unwrap();
        objects.put("finsup/GL/FY2015/JRNL_VAT_2015.00000.csv", b"other table").unwrap();

        let report = archive_lines(&config, &source, &objects, &warehouse, window());

        assert_eq!(report.stale_artifacts_removed, 2);
        assert!(objects.head("finsup/GL/FY2015/JRNL_LN_2015.00007.csv").unwrap().is_none());
        assert!(objects.head("finsup/GL/FY2019/JRNL_LN_2019.00000.csv").unwrap().is_none());
        assert!(objects.head("finsup/GL/FY2015/JRNL_VAT_2015.00000.csv").unwrap().is_some());
    }

    #[test]
    fn test_expired_partitions_are_not_recreated() {
        let config = sample_config();
        let source = gl_source();
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        let narrow = RetentionWindow {
            current_fiscal_year: 2025,
            window_years: 7,
        };

        let report = archive_lines(&config, &source, &objects, &warehouse, narrow);

        // FY2015 and FY2017 are past a 7 year window; FY2024 and orphans are not
        assert_eq!(report.expired_rows, 3);
        assert!(objects.list("finsup/GL/FY2015/").unwrap().is_empty());
        assert!(objects.list("finsup/GL/FY2017/").unwrap().is_empty());
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2024)).unwrap(), 1);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Orphan).unwrap(), 3);
    }

    #[test]
    fn test_held_partitions_past_window_are_archived() {
        let mut config = sample_config();
        config.holds.push(LegalHoldConfig {
            module: "GL".to_string(),
            fiscal_year: 2015,
        });
        let source = gl_source();
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        warehouse.place_hold("GL", 2017, "audit request").unwrap();
        objects.put("finsup/GL/FY2015/JRNL_LN_2015.00003.csv", b"old").unwrap();
        objects.put("finsup/GL/FY2010/JRNL_LN_2010.00000.csv", b"retired").unwrap();
        let narrow = RetentionWindow {
            current_fiscal_year: 2025,
            window_years: 7,
        };

        let report = archive_lines(&config, &source, &objects, &warehouse, narrow);

        // FY2015 held by configuration, FY2017 by the registry
        assert_eq!(report.expired_rows, 0);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2015)).unwrap(), 2);
        assert_eq!(warehouse.count_partition("JRNL_LN", FiscalYearTag::Year(2017)).unwrap(), 1);
        assert_eq!(objects.list("finsup/GL/FY2017/").unwrap().len(), 1);

        // Stale chunk of a held year is refreshed away; an unheld expired year is left to retention
        assert_eq!(report.stale_artifacts_removed, 1);
        assert!(objects.head("finsup/GL/FY2015/JRNL_LN_2015.00003.csv").unwrap().is_none());
        assert!(objects.head("finsup/GL/FY2010/JRNL_LN_2010.00000.csv").unwrap().is_some());
    }

    /// Source that grows one JRNL_VAT row between the count and write passes
    struct GrowingSource {
        inner: SqliteSource,
    }

    impl SourceStore for GrowingSource {
        fn scan(
            &self,
            request: &ScanRequest,
            visit: &mut dyn FnMut(TableBatch) -> ArchiveResult<()>,
        ) -> ArchiveResult<()> {
            self.inner.scan(request, visit)?;
            match &request.columns {
                Some(columns) if request.table == "JRNL_VAT" => visit(TableBatch {
                    table: request.table.clone(),
                    columns: columns.clone(),
                    rows: vec![vec![Value::from("US01"), Value::from("J4"), Value::from("V10")]],
                }),
                _ => Ok(()),
            }
        }

        fn row_count(&self, table: &str) -> ArchiveResult<u64> {
            self.inner.row_count(table)
        }

        fn columns(&self, table: &str) -> ArchiveResult<Vec<String>> {
            self.inner.columns(table)
        }
    }

    #[test]
    fn test_partition_appearing_mid_run_is_written() {
        let config = sample_config();
        let source = GrowingSource { inner: gl_source() };
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        let module = &config.modules[0];
        let resolved = FiscalYearResolver::for_module(&config, module)
            .resolve(&source, module)
            .unwrap();

        let report = PartitionedWriter::new(&config, &source, &objects, &warehouse, window(), "run-grow")
            .write_table(module, &resolved, "JRNL_VAT")
            .unwrap();

        // Counted FY2017 only; J4 (FY2024) showed up during the write pass
        assert_eq!(report.rows_written(), 2);
        assert_eq!(report.partitions.len(), 2);
        assert_eq!(warehouse.count_partition("JRNL_VAT", FiscalYearTag::Year(2024)).unwrap(), 1);
        let fy2024 = objects.list("finsup/GL/FY2024/").unwrap();
        assert_eq!(fy2024.len(), 1);
        assert_eq!(fy2024[0].path, "finsup/GL/FY2024/JRNL_VAT_2024.00000.csv");
    }

    #[test]
    fn test_encode_chunk() {
        let body = encode_chunk(
            &["A".to_string(), "B".to_string()],
            FiscalYearTag::Year(2020),
            &[vec![Value::from("x,y"), Value::Null], vec![Value::from(3), Value::from(true)]],
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "A,B,fy_partition\n\"x,y\",,2020\n3,true,2020\n"
        );
    }
}
