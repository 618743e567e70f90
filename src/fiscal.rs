// Fiscal Calendar - dates, fiscal year tags, and partition keys
//
// Fiscal year N covers [N-1/start_month/01, N/start_month/01 - 1 day] when the
// fiscal year does not start in January, and the calendar year otherwise.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved tag value for rows with no usable canonical date
pub const ORPHAN_FISCAL_YEAR: i32 = 2099;

// ============================================================================
// FISCAL YEAR TAG
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum FiscalYearTag {
    Year(i32),
    Orphan,
}

impl FiscalYearTag {
    /// Integer stored in `fy_partition` and used in storage paths
    pub fn value(self) -> i32 {
        match self {
            FiscalYearTag::Year(year) => year,
            FiscalYearTag::Orphan => ORPHAN_FISCAL_YEAR,
        }
    }

    pub fn from_value(value: i32) -> Self {
        if value == ORPHAN_FISCAL_YEAR {
            FiscalYearTag::Orphan
        } else {
            FiscalYearTag::Year(value)
        }
    }

    pub fn is_orphan(self) -> bool {
        matches!(self, FiscalYearTag::Orphan)
    }

    /// Folder name in the object store, e.g. `FY2024` or `FY2099`
    pub fn folder(self) -> String {
        format!("FY{}", self.value())
    }
}

impl From<FiscalYearTag> for i32 {
    fn from(tag: FiscalYearTag) -> Self {
        tag.value()
    }
}

impl From<i32> for FiscalYearTag {
    fn from(value: i32) -> Self {
        FiscalYearTag::from_value(value)
    }
}

impl fmt::Display for FiscalYearTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiscalYearTag::Year(year) => write!(f, "FY{}", year),
            FiscalYearTag::Orphan => write!(f, "FY{} (orphan)", ORPHAN_FISCAL_YEAR),
        }
    }
}

// ============================================================================
// PARTITION KEY
// ============================================================================

/// Unit of storage and retention: (module, fiscal year tag)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub module: String,
    pub tag: FiscalYearTag,
}

impl Partition {
    pub fn new(module: impl Into<String>, tag: FiscalYearTag) -> Self {
        Partition {
            module: module.into(),
            tag,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.tag.is_orphan()
    }

    /// Object-store prefix holding every artifact of this partition
    pub fn prefix(&self, root: &str) -> String {
        format!("{}{}/", module_prefix(root, &self.module), self.tag.folder())
    }
}

/// Object-store prefix holding every partition folder of a module
pub fn module_prefix(root: &str, module: &str) -> String {
    if root.is_empty() {
        format!("{}/", module)
    } else {
        format!("{}/{}/", root.trim_end_matches('/'), module)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.tag.folder())
    }
}

// ============================================================================
// FISCAL CALENDAR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiscalCalendar {
    /// Month (1-12) on which the fiscal year begins
    start_month: u32,
}

impl FiscalCalendar {
    pub fn new(start_month: u32) -> Self {
        FiscalCalendar {
            start_month: start_month.clamp(1, 12),
        }
    }

    pub fn start_month(&self) -> u32 {
        self.start_month
    }

    pub fn fiscal_year(&self, date: NaiveDate) -> i32 {
        if self.start_month > 1 && date.month() >= self.start_month {
            date.year() + 1
        } else {
            date.year()
        }
    }

    /// Inclusive first and last calendar day of a fiscal year
    pub fn bounds(&self, fiscal_year: i32) -> Option<(NaiveDate, NaiveDate)> {
        let start_year = if self.start_month > 1 {
            fiscal_year - 1
        } else {
            fiscal_year
        };
        let start = NaiveDate::from_ymd_opt(start_year, self.start_month, 1)?;
        let next = NaiveDate::from_ymd_opt(start_year + 1, self.start_month, 1)?;
        Some((start, next.pred_opt()?))
    }
}

impl Default for FiscalCalendar {
    fn default() -> Self {
        FiscalCalendar::new(1)
    }
}

// ============================================================================
// DATE PARSING
// ============================================================================

/// Calendar years a canonical date may fall in; anything else is orphaned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBounds {
    pub min_year: i32,
    pub max_year: i32,
}

impl DateBounds {
    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.min_year..=self.max_year).contains(&date.year())
    }

    /// Parse and range-check; invalid or out-of-range values are absent
    pub fn accept(&self, raw: &str) -> Option<NaiveDate> {
        parse_calendar_date(raw).filter(|date| self.contains(*date))
    }
}

/// Parse the date shapes the operational store is known to emit
pub fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.date());
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y").ok()
}
