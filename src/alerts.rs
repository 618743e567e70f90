// Alert Sink - structured reconciliation alerts handed to notification transport
//
// Transport is somebody else's problem; the archive only promises the event
// shape. Sinks provided here: tracing log, JSON-lines file, in-memory.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, warn};

use crate::error::{ArchiveError, ArchiveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,  // one threshold breached
    Critical, // both thresholds breached
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub module: String,
    pub table: String,
    pub fiscal_year: i32,
    pub source_count: u64,
    pub target_count: u64,
    pub delta: i64,
    /// None when the source partition is empty
    pub pct: Option<f64>,
    pub severity: Severity,
    pub run_id: String,
}

pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &AlertEvent) -> ArchiveResult<()>;
}

/// Emits alerts as tracing events
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, event: &AlertEvent) -> ArchiveResult<()> {
        match event.severity {
            Severity::Critical => error!(
                module = %event.module,
                table = %event.table,
                fiscal_year = event.fiscal_year,
                source_count = event.source_count,
                target_count = event.target_count,
                delta = event.delta,
                pct = ?event.pct,
                "Reconciliation mismatch"
            ),
            Severity::Warning => warn!(
                module = %event.module,
                table = %event.table,
                fiscal_year = event.fiscal_year,
                source_count = event.source_count,
                target_count = event.target_count,
                delta = event.delta,
                pct = ?event.pct,
                "Reconciliation mismatch"
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per alert to a file watched by the notifier
pub struct JsonlAlertSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAlertSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlAlertSink {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl AlertSink for JsonlAlertSink {
    fn emit(&self, event: &AlertEvent) -> ArchiveResult<()> {
        let line = serde_json::to_string(event)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ArchiveError::transient("alert sink", "lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Collects alerts in memory
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AlertSink for MemoryAlertSink {
    fn emit(&self, event: &AlertEvent) -> ArchiveResult<()> {
        self.events
            .lock()
            .map_err(|_| ArchiveError::transient("alert sink", "lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Fans one alert out to several sinks; every sink is attempted
pub struct FanoutAlertSink {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Box<dyn AlertSink>>) -> Self {
        FanoutAlertSink { sinks }
    }
}

impl AlertSink for FanoutAlertSink {
    fn emit(&self, event: &AlertEvent) -> ArchiveResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> AlertEvent {
        AlertEvent {
            module: "GL".to_string(),
            table: "JRNL_LN".to_string(),
            fiscal_year: 2024,
            source_count: 1000,
            target_count: 950,
            delta: -50,
            pct: Some(-0.05),
            severity: Severity::Warning,
            run_id: "run-1".to_string(),
        }
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let sink = JsonlAlertSink::new(&path);

        sink.emit(&event()).unwrap();
        sink.emit(&event()).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AlertEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, event());
        assert!(lines[0].contains("\"severity\":\"warning\""));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FanoutAlertSink::new(vec![
            Box::new(LogAlertSink),
            // Parent directory does not exist, so this sink fails
            Box::new(JsonlAlertSink::new(dir.path().join("missing/alerts.jsonl"))),
            Box::new(JsonlAlertSink::new(dir.path().join("alerts.jsonl"))),
        ]);

        assert!(sink.emit(&event()).is_err());
        assert!(dir.path().join("alerts.jsonl").exists());
    }

    #[test]
    fn test_severity_strings() {
        assert_eq!(Severity::parse(Severity::Critical.as_str()), Some(Severity::Critical));
        assert_eq!(Severity::parse("info"), None);
    }
}
