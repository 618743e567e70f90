// Layout Report - what is archived where, and by which rule
//
// One line per (module, table, partition) found in either store, with the
// date window that routed rows there (or the orphan rule).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use crate::config::ArchiveConfig;
use crate::error::ArchiveResult;
use crate::fiscal::{module_prefix, FiscalYearTag};
use crate::object_store::{parse_artifact_name, ObjectStore};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRow {
    pub module: String,
    pub table: String,
    pub date_table: String,
    pub partition: String,
    pub criteria: String,
    pub warehouse_rows: u64,
    pub objects: usize,
}

pub fn layout(
    config: &ArchiveConfig,
    objects: &dyn ObjectStore,
    warehouse: &dyn Warehouse,
) -> ArchiveResult<Vec<LayoutRow>> {
    let mut rows = Vec::new();
    for module in &config.modules {
        let calendar = config.calendar_for(module);

        // (table, tag) -> chunk objects
        let mut chunks: BTreeMap<(String, FiscalYearTag), usize> = BTreeMap::new();
        for object in objects.list(&module_prefix(&config.object_root, &module.name))? {
            if let Some((table, year, _)) = parse_artifact_name(&object.path) {
                *chunks.entry((table, FiscalYearTag::from_value(year))).or_default() += 1;
            }
        }

        for table in module.tables() {
            let mut tags: BTreeSet<FiscalYearTag> = warehouse.partitions(table)?.into_iter().collect();
            tags.extend(
                chunks
                    .keys()
                    .filter(|(name, _)| name == table)
                    .map(|(_, tag)| *tag),
            );

            for tag in tags {
                let criteria = match tag {
                    FiscalYearTag::Orphan => "orphan rows (no match in date table)".to_string(),
                    FiscalYearTag::Year(year) => match calendar.bounds(year) {
                        Some((start, end)) => format!(
                            "{} between {}/{}",
                            module.date_column,
                            start.format("%Y-%m-%d"),
                            end.format("%Y-%m-%d")
                        ),
                        None => format!("{} in FY{}", module.date_column, year),
                    },
                };
                rows.push(LayoutRow {
                    module: module.name.clone(),
                    table: table.to_string(),
                    date_table: module.date_table.clone(),
                    partition: tag.folder(),
                    criteria,
                    warehouse_rows: warehouse.count_partition(table, tag)?,
                    objects: chunks.get(&(table.to_string(), tag)).copied().unwrap_or(0),
                });
            }
        }
    }
    rows.sort_by(|a, b| {
        (&a.module, &a.table, &a.partition).cmp(&(&b.module, &b.table, &b.partition))
    });
    Ok(rows)
}

pub fn write_csv<W: Write>(rows: &[LayoutRow], out: W) -> ArchiveResult<()> {
    let mut writer = csv::Writer::from_writer(out);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Aligned, markdown-friendly table
pub fn render_table(rows: &[LayoutRow]) -> String {
    let header = [
        "module",
        "table",
        "date_table",
        "partition",
        "criteria",
        "rows",
        "objects",
    ];
    let cells: Vec<[String; 7]> = rows
        .iter()
        .map(|r| {
            [
                r.module.clone(),
                r.table.clone(),
                r.date_table.clone(),
                r.partition.clone(),
                r.criteria.clone(),
                r.warehouse_rows.to_string(),
                r.objects.to_string(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let line = |values: Vec<&str>| -> String {
        let padded: Vec<String> = values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = w))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };

    let mut out = line(header.to_vec());
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&line(rule.iter().map(String::as_str).collect()));
    for row in &cells {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::object_store::MemoryObjectStore;
    use crate::warehouse::SqliteWarehouse;
    use serde_json::Value;

    fn stores() -> (MemoryObjectStore, SqliteWarehouse) {
        let objects = MemoryObjectStore::new();
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        let cols = vec!["JOURNAL_ID".to_string()];
        warehouse.ensure_table("JRNL_LN", &cols).unwrap();
        warehouse
            .append_rows("JRNL_LN", &cols, FiscalYearTag::Year(2024), &[vec![Value::from("J4")]])
            .unwrap();
        objects.put("finsup/GL/FY2024/JRNL_LN_2024.00000.csv", b"x").unwrap();
        objects.put("finsup/GL/FY2099/JRNL_LN_2099.00000.csv", b"x").unwrap();
        objects.put("finsup/GL/FY2099/JRNL_LN_2099.00001.csv", b"x").unwrap();
        (objects, warehouse)
    }

    #[test]
    fn test_layout_rows() {
        let config = sample_config();
        let (objects, warehouse) = stores();

        let rows = layout(&config, &objects, &warehouse).unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].partition, "FY2024");
        assert_eq!(rows[0].criteria, "ACCOUNTING_DT between 2024-01-01/2024-12-31");
        assert_eq!(rows[0].warehouse_rows, 1);
        assert_eq!(rows[0].objects, 1);
        assert_eq!(rows[0].date_table, "JRNL_HDR");

        assert_eq!(rows[1].partition, "FY2099");
        assert!(rows[1].criteria.starts_with("orphan rows"));
        assert_eq!(rows[1].warehouse_rows, 0);
        assert_eq!(rows[1].objects, 2);
    }

    #[test]
    fn test_rendering() {
        let config = sample_config();
        let (objects, warehouse) = stores();
        let rows = layout(&config, &objects, &warehouse).unwrap();

        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("| module | table"));
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));

        let mut csv_out = Vec::new();
        write_csv(&rows, &mut csv_out).unwrap();
        let text = String::from_utf8(csv_out).unwrap();
        assert!(text.starts_with("module,table,date_table,partition,criteria,warehouse_rows,objects\n"));
        assert_eq!(text.lines().count(), 3);
    }
}
