use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fy_archive::{
    report, AlertSink, ArchiveConfig, AuditQuery, CancelToken, DeletionScope, DeletionTargets,
    FanoutAlertSink, JsonlAlertSink, LocalObjectStore, LogAlertSink, Phases, SqliteSource,
    SqliteWarehouse, Stores, Sweep, SweepOptions, SweepReport,
};

/// Bad invocation; kept clear of the sweep's own exit codes (sysexits EX_USAGE)
const EXIT_USAGE: i32 = 64;

const USAGE: &str = "\
usage: fy-archive <command> <config> [options]

commands:
  sweep       archive, apply retention, reconcile
  archive     resolve, tag and write every module
  retention   delete partitions past the window   [--dry-run] [--tables-only|--objects-only]
  reconcile   compare source and archive counts
  report      archive layout                      [--csv <file>]
  holds       list legal holds
  hold        place a hold       --module <m> --year <y> [--reason <text>]
  release     release a hold     --module <m> --year <y>
  audit       reconciliation audit trail          [--limit <n>]

options:
  --module <name>     restrict to one module
  --year <fy>         restrict to one fiscal year
  --force             retention: bypass the age window for --year (never a hold)
  --as-of <date>      measure the window from this date (YYYY-MM-DD)

environment:
  FY_ARCHIVE_LOG            tracing filter (default: info)
  FY_ARCHIVE_SOURCE_DB      overrides paths.source_db
  FY_ARCHIVE_WAREHOUSE_DB   overrides paths.warehouse_db
  FY_ARCHIVE_OBJECT_DIR     overrides paths.object_dir
  FY_ARCHIVE_ALERT_LOG      overrides paths.alert_log";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("FY_ARCHIVE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Flags shared by every command
#[derive(Debug, Default)]
struct Args {
    module: Option<String>,
    year: Option<i32>,
    force: bool,
    dry_run: bool,
    targets: DeletionTargets,
    as_of: Option<NaiveDate>,
    csv: Option<PathBuf>,
    reason: Option<String>,
    limit: Option<usize>,
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let mut args = Args::default();
    let mut iter = raw.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .with_context(|| format!("{} needs a value", flag))
        };
        match flag.as_str() {
            "--module" => args.module = Some(value()?),
            "--year" => args.year = Some(value()?.parse().context("--year must be an integer")?),
            "--force" => args.force = true,
            "--dry-run" => args.dry_run = true,
            "--tables-only" => args.targets = DeletionTargets::TablesOnly,
            "--objects-only" => args.targets = DeletionTargets::ObjectsOnly,
            "--as-of" => {
                let raw = value()?;
                args.as_of = Some(
                    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                        .with_context(|| format!("Invalid --as-of date: {}", raw))?,
                );
            }
            "--csv" => args.csv = Some(PathBuf::from(value()?)),
            "--reason" => args.reason = Some(value()?),
            "--limit" => args.limit = Some(value()?.parse().context("--limit must be an integer")?),
            other => bail!("Unknown option: {}\n\n{}", other, USAGE),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    init_tracing();

    let argv: Vec<String> = env::args().collect();
    if argv.len() < 3 {
        eprintln!("{}", USAGE);
        std::process::exit(EXIT_USAGE);
    }
    let command = argv[1].as_str();
    let config = ArchiveConfig::load(Path::new(&argv[2]))?;
    let args = parse_args(&argv[3..])?;

    let code = match command {
        "sweep" => run_sweep(&config, &args, Phases::all())?,
        "archive" => run_sweep(&config, &args, Phases::only_archive())?,
        "retention" => run_sweep(&config, &args, Phases::only_retention())?,
        "reconcile" => run_sweep(&config, &args, Phases::only_reconcile())?,
        "report" => run_report(&config, &args)?,
        "holds" => run_list_holds(&config)?,
        "hold" => run_hold(&config, &args, true)?,
        "release" => run_hold(&config, &args, false)?,
        "audit" => run_audit(&config, &args)?,
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

fn required<'a>(path: &'a Option<PathBuf>, name: &str) -> Result<&'a Path> {
    match path {
        Some(path) => Ok(path.as_path()),
        None => bail!("paths.{} is not configured", name),
    }
}

fn open_warehouse(config: &ArchiveConfig) -> Result<SqliteWarehouse> {
    let path = required(&config.paths.warehouse_db, "warehouse_db")?;
    SqliteWarehouse::open(path)
        .with_context(|| format!("Failed to open warehouse {}", path.display()))
}

fn run_sweep(config: &ArchiveConfig, args: &Args, phases: Phases) -> Result<i32> {
    let source_path = required(&config.paths.source_db, "source_db")?;
    let source = SqliteSource::open(source_path)
        .with_context(|| format!("Failed to open source {}", source_path.display()))?;
    let objects = LocalObjectStore::new(required(&config.paths.object_dir, "object_dir")?)?;
    let warehouse = open_warehouse(config)?;

    let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogAlertSink)];
    if let Some(path) = &config.paths.alert_log {
        sinks.push(Box::new(JsonlAlertSink::new(path)));
    }
    let alerts = FanoutAlertSink::new(sinks);

    let stores = Stores {
        source: &source,
        objects: &objects,
        warehouse: &warehouse,
        audit: &warehouse,
        alerts: &alerts,
    };
    let options = SweepOptions {
        phases,
        scope: DeletionScope {
            module: args.module.clone(),
            fiscal_year: args.year,
            force: args.force,
        },
        targets: args.targets,
        dry_run: args.dry_run,
        as_of: args.as_of.unwrap_or_else(|| Utc::now().date_naive()),
    };

    let sweep = Sweep::new(config, stores, CancelToken::new());
    let report = sweep.run(&options);

    if phases.retention && !args.dry_run {
        let purged = warehouse.purge_expired_snapshots(Utc::now())?;
        if purged > 0 {
            println!("✓ Purged {} expired snapshots", purged);
        }
    }

    print_summary(&report);
    Ok(report.exit_code())
}

fn print_summary(report: &SweepReport) {
    println!("Run {}", report.run_id);

    for write in &report.writes {
        println!(
            "  archived {}/{}: {} rows, {} chunks written, {} unchanged, {} stale removed",
            write.module,
            write.table,
            write.rows_written(),
            write.chunks_written(),
            write.chunks_skipped(),
            write.stale_artifacts_removed
        );
    }

    if let Some(plan) = &report.plan {
        for partition in plan.held() {
            println!("  HELD     {}", partition.partition);
        }
        if report.deletions.is_empty() {
            for partition in plan.to_delete() {
                println!("  would delete {}", partition.partition);
                for op in &partition.deletes {
                    println!("    snapshot + DELETE FROM {} WHERE {}", op.table, op.predicate);
                }
                if let Some(prefix) = &partition.object_prefix {
                    println!("    remove objects under {}", prefix);
                }
            }
        }
    }
    for deletion in &report.deletions {
        println!(
            "  {:?} {}: {} objects removed",
            deletion.status, deletion.partition, deletion.objects_removed
        );
    }

    for reconciliation in &report.reconciliations {
        for record in reconciliation.records.iter().filter(|r| r.alerted) {
            println!(
                "  ALERT {}/{} FY{}: source {} archive {} (delta {})",
                record.module, record.table, record.fiscal_year,
                record.source_count, record.target_count, record.delta
            );
        }
    }

    for unit in report.units.iter().filter(|u| u.status.is_failure()) {
        println!(
            "  {:?} {:?} {}: {}",
            unit.status,
            unit.kind,
            unit.unit,
            unit.error.as_deref().unwrap_or("-")
        );
    }
    println!("Worst outcome: {:?}", report.worst());
}

fn run_report(config: &ArchiveConfig, args: &Args) -> Result<i32> {
    let objects = LocalObjectStore::new(required(&config.paths.object_dir, "object_dir")?)?;
    let warehouse = open_warehouse(config)?;
    let rows = report::layout(config, &objects, &warehouse)?;

    match &args.csv {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            report::write_csv(&rows, file)?;
            println!("✓ Report written → {}", path.display());
        }
        None => print!("{}", report::render_table(&rows)),
    }
    Ok(0)
}

fn run_list_holds(config: &ArchiveConfig) -> Result<i32> {
    let warehouse = open_warehouse(config)?;
    for hold in &config.holds {
        println!("{}  FY{}  (configuration)", hold.module, hold.fiscal_year);
    }
    for hold in warehouse.list_holds()? {
        println!(
            "{}  FY{}  {}  placed {}",
            hold.module,
            hold.fiscal_year,
            hold.reason,
            hold.placed_at.format("%Y-%m-%d")
        );
    }
    Ok(0)
}

fn run_hold(config: &ArchiveConfig, args: &Args, place: bool) -> Result<i32> {
    let (Some(module), Some(year)) = (&args.module, args.year) else {
        bail!("--module and --year are required");
    };
    if config.module(module).is_none() {
        bail!("Unknown module: {}", module);
    }
    let warehouse = open_warehouse(config)?;

    if place {
        let reason = args.reason.as_deref().unwrap_or("legal hold");
        warehouse.place_hold(module, year, reason)?;
        println!("✓ Hold placed on {}/FY{}", module, year);
    } else if warehouse.release_hold(module, year)? {
        println!("✓ Hold released on {}/FY{}", module, year);
    } else {
        println!("No registry hold on {}/FY{}", module, year);
    }
    Ok(0)
}

fn run_audit(config: &ArchiveConfig, args: &Args) -> Result<i32> {
    let warehouse = open_warehouse(config)?;
    let records = warehouse.reconciliations(&AuditQuery {
        module: args.module.clone(),
        fiscal_year: args.year,
        since: None,
        limit: args.limit.or(Some(100)),
    })?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fy_archive::pipeline::exit_code_for;
    use fy_archive::UnitStatus;

    #[test]
    fn test_usage_exit_code_is_distinct() {
        for status in [
            UnitStatus::Succeeded,
            UnitStatus::Skipped,
            UnitStatus::Alerted,
            UnitStatus::Failed,
            UnitStatus::Partial,
            UnitStatus::Cancelled,
        ] {
            assert_ne!(exit_code_for(status), EXIT_USAGE, "{:?}", status);
        }
    }

    #[test]
    fn test_parse_args() {
        let raw: Vec<String> = ["--module", "GL", "--year", "2017", "--force", "--objects-only"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let args = parse_args(&raw).unwrap();
        assert_eq!(args.module.as_deref(), Some("GL"));
        assert_eq!(args.year, Some(2017));
        assert!(args.force);
        assert_eq!(args.targets, DeletionTargets::ObjectsOnly);
        assert!(parse_args(&["--year".to_string()]).is_err());
    }
}
