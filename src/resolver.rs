// Fiscal Year Resolver - business key -> canonical date -> fiscal year tag
//
// The canonical date of a key is the earliest valid, in-range value of the
// module's date column across every date-table row carrying that key.
// Malformed or out-of-range dates are simply absent; a key with no canonical
// date resolves to the orphan tag. Resolution never fails on data.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::config::{ArchiveConfig, ModuleConfig};
use crate::error::ArchiveResult;
use crate::fiscal::{DateBounds, FiscalCalendar, FiscalYearTag};
use crate::source::{BusinessKey, ScanRequest, SourceStore, TableBatch};

const RESOLVER_SCAN_ROWS: usize = 10_000;

// ============================================================================
// RESOLVED KEYS
// ============================================================================

/// Output of one resolution pass over a module's date table
#[derive(Debug, Clone, Default)]
pub struct ResolvedKeys {
    canonical: HashMap<BusinessKey, Option<NaiveDate>>,
    tags: HashMap<BusinessKey, FiscalYearTag>,
}

impl ResolvedKeys {
    /// Tag for a key; None means the key never appeared in the date table
    pub fn tag(&self, key: &BusinessKey) -> Option<FiscalYearTag> {
        self.tags.get(key).copied()
    }

    pub fn canonical_date(&self, key: &BusinessKey) -> Option<NaiveDate> {
        self.canonical.get(key).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.tags.values().filter(|tag| tag.is_orphan()).count()
    }

    /// Number of keys per tag
    pub fn histogram(&self) -> BTreeMap<FiscalYearTag, usize> {
        let mut out = BTreeMap::new();
        for tag in self.tags.values() {
            *out.entry(*tag).or_insert(0) += 1;
        }
        out
    }
}

// ============================================================================
// FISCAL YEAR RESOLVER
// ============================================================================

pub struct FiscalYearResolver {
    calendar: FiscalCalendar,
    bounds: DateBounds,
}

impl FiscalYearResolver {
    pub fn new(calendar: FiscalCalendar, bounds: DateBounds) -> Self {
        FiscalYearResolver { calendar, bounds }
    }

    pub fn for_module(config: &ArchiveConfig, module: &ModuleConfig) -> Self {
        Self::new(config.calendar_for(module), config.date_bounds())
    }

    pub fn calendar(&self) -> FiscalCalendar {
        self.calendar
    }

    /// Pure mapping from canonical date to tag
    pub fn tag_for(&self, canonical: Option<NaiveDate>) -> FiscalYearTag {
        match canonical {
            Some(date) if self.bounds.contains(date) => {
                FiscalYearTag::Year(self.calendar.fiscal_year(date))
            }
            _ => FiscalYearTag::Orphan,
        }
    }

    /// Read the module's date table and resolve every key found in it
    pub fn resolve(
        &self,
        source: &dyn SourceStore,
        module: &ModuleConfig,
    ) -> ArchiveResult<ResolvedKeys> {
        let mut columns = module.key_columns.clone();
        columns.push(module.date_column.clone());
        let request = ScanRequest {
            table: module.date_table.clone(),
            columns: Some(columns),
            order_by: module.key_columns.clone(),
            batch_rows: RESOLVER_SCAN_ROWS,
        };

        let mut canonical = HashMap::new();
        source.scan(&request, &mut |batch| {
            self.observe_batch(&batch, module, &mut canonical);
            Ok(())
        })?;

        let resolved = self.finish(canonical);
        info!(
            module = %module.name,
            keys = resolved.len(),
            orphans = resolved.orphan_count(),
            "Resolved fiscal years"
        );
        Ok(resolved)
    }

    /// Fold one batch of date-table rows into the running minimum per key
    pub fn observe_batch(
        &self,
        batch: &TableBatch,
        module: &ModuleConfig,
        canonical: &mut HashMap<BusinessKey, Option<NaiveDate>>,
    ) {
        let (Some(key_indexes), Some(date_index)) = (
            batch.key_indexes(&module.key_columns),
            batch.column_index(&module.date_column),
        ) else {
            debug!(table = %batch.table, "Date table batch lacks key or date columns");
            return;
        };

        for row in &batch.rows {
            let Some(key) = TableBatch::key_of(row, &key_indexes) else {
                continue;
            };
            let date = row.get(date_index).and_then(|value| self.accept_date(value));
            let slot = canonical.entry(key).or_insert(None);
            if let Some(date) = date {
                if slot.map_or(true, |current| date < current) {
                    *slot = Some(date);
                }
            }
        }
    }

    pub fn finish(&self, canonical: HashMap<BusinessKey, Option<NaiveDate>>) -> ResolvedKeys {
        let tags = canonical
            .iter()
            .map(|(key, date)| (key.clone(), self.tag_for(*date)))
            .collect();
        ResolvedKeys { canonical, tags }
    }

    fn accept_date(&self, value: &Value) -> Option<NaiveDate> {
        match value {
            Value::String(raw) => self.bounds.accept(raw),
            _ => None,
        }
    }
}
