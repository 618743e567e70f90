// Cross-Table Tagger - stamps every row with its partition routing tag
//
// Business columns pass through untouched; the tag travels alongside the row.
// Anything that cannot be matched to a resolved key (unknown key, null key
// column, table without the key columns) takes the single orphan fallback.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::ModuleConfig;
use crate::error::ArchiveResult;
use crate::fiscal::FiscalYearTag;
use crate::resolver::ResolvedKeys;
use crate::source::{ScanRequest, SourceStore, TableBatch};

/// Rows of one batch with the tag assigned to each, index for index
#[derive(Debug, Clone)]
pub struct TaggedBatch {
    pub batch: TableBatch,
    pub tags: Vec<FiscalYearTag>,
}

impl TaggedBatch {
    /// Split into per-partition row groups, preserving row order within each
    pub fn into_partitions(self) -> BTreeMap<FiscalYearTag, Vec<Vec<Value>>> {
        let mut out: BTreeMap<FiscalYearTag, Vec<Vec<Value>>> = BTreeMap::new();
        for (row, tag) in self.batch.rows.into_iter().zip(self.tags) {
            out.entry(tag).or_default().push(row);
        }
        out
    }
}

pub struct CrossTableTagger<'a> {
    resolved: &'a ResolvedKeys,
    key_columns: &'a [String],
}

impl<'a> CrossTableTagger<'a> {
    pub fn new(resolved: &'a ResolvedKeys, module: &'a ModuleConfig) -> Self {
        CrossTableTagger {
            resolved,
            key_columns: &module.key_columns,
        }
    }

    pub fn tag(&self, batch: TableBatch) -> TaggedBatch {
        let tags = match batch.key_indexes(self.key_columns) {
            Some(indexes) => batch
                .rows
                .iter()
                .map(|row| {
                    TableBatch::key_of(row, &indexes)
                        .and_then(|key| self.resolved.tag(&key))
                        .unwrap_or(FiscalYearTag::Orphan)
                })
                .collect(),
            None => {
                warn!(
                    table = %batch.table,
                    rows = batch.len(),
                    "Table lacks business key columns, routing rows to orphan partition"
                );
                vec![FiscalYearTag::Orphan; batch.len()]
            }
        };
        TaggedBatch { batch, tags }
    }

    /// Rows per tag for a whole table
    pub fn count_table(
        &self,
        source: &dyn SourceStore,
        table: &str,
        batch_rows: usize,
    ) -> ArchiveResult<BTreeMap<FiscalYearTag, u64>> {
        let request = ScanRequest {
            table: table.to_string(),
            columns: None,
            order_by: Vec::new(),
            batch_rows,
        };
        let mut counts = BTreeMap::new();
        source.scan(&request, &mut |batch| {
            for tag in self.tag(batch).tags {
                *counts.entry(tag).or_insert(0u64) += 1;
            }
            Ok(())
        })?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::resolver::FiscalYearResolver;
    use crate::source::tests::gl_source;

    fn resolved() -> ResolvedKeys {
        let config = sample_config();
        let module = &config.modules[0];
        FiscalYearResolver::for_module(&config, module)
            .resolve(&gl_source(), module)
            .unwrap()
    }

    #[test]
    fn test_every_row_gets_exactly_one_tag() {
        let config = sample_config();
        let module = &config.modules[0];
        let resolved = resolved();
        let tagger = CrossTableTagger::new(&resolved, module);

        let counts = tagger.count_table(&gl_source(), "JRNL_LN", 2).unwrap();
        let total: u64 = counts.values().sum();

        assert_eq!(total, 7);
        assert_eq!(counts.get(&FiscalYearTag::Year(2015)), Some(&2));
        assert_eq!(counts.get(&FiscalYearTag::Year(2017)), Some(&1));
        assert_eq!(counts.get(&FiscalYearTag::Year(2024)), Some(&1));
        // J3 (bad date), J9 (unknown key) and the null-key row
        assert_eq!(counts.get(&FiscalYearTag::Orphan), Some(&3));
    }

    #[test]
    fn test_tagging_leaves_business_columns_alone() {
        let config = sample_config();
        let module = &config.modules[0];
        let resolved = resolved();
        let tagger = CrossTableTagger::new(&resolved, module);

        let batch = TableBatch {
            table: "JRNL_LN".to_string(),
            columns: vec![
                "BUSINESS_UNIT".to_string(),
                "JOURNAL_ID".to_string(),
                "AMOUNT".to_string(),
            ],
            rows: vec![
                vec![Value::from("US01"), Value::from("J2"), Value::from(99.0)],
                vec![Value::from("US01"), Value::from("J3"), Value::from(1.0)],
            ],
        };
        let original = batch.clone();
        let tagged = tagger.tag(batch);

        assert_eq!(tagged.batch, original);
        assert_eq!(
            tagged.tags,
            vec![FiscalYearTag::Year(2017), FiscalYearTag::Orphan]
        );
    }

    #[test]
    fn test_orphan_rows_do_not_disturb_neighbours() {
        let config = sample_config();
        let module = &config.modules[0];
        let resolved = resolved();
        let tagger = CrossTableTagger::new(&resolved, module);

        let batch = TableBatch {
            table: "JRNL_LN".to_string(),
            columns: vec!["BUSINESS_UNIT".to_string(), "JOURNAL_ID".to_string()],
            rows: vec![
                vec![Value::from("US01"), Value::from("J3")],
                vec![Value::from("US01"), Value::from("J1")],
                vec![Value::from("US01"), Value::from("J3")],
            ],
        };
        let partitions = tagger.tag(batch).into_partitions();

        assert_eq!(partitions[&FiscalYearTag::Orphan].len(), 2);
        assert_eq!(partitions[&FiscalYearTag::Year(2015)].len(), 1);
    }

    #[test]
    fn test_table_without_keys_is_orphaned() {
        let config = sample_config();
        let module = &config.modules[0];
        let resolved = resolved();
        let tagger = CrossTableTagger::new(&resolved, module);

        let batch = TableBatch {
            table: "LOOKUP".to_string(),
            columns: vec!["CODE".to_string()],
            rows: vec![vec![Value::from("A")], vec![Value::from("B")]],
        };
        let tagged = tagger.tag(batch);
        assert!(tagged.tags.iter().all(|tag| tag.is_orphan()));
    }
}
