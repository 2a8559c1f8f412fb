//! Command-line front-end: creates the configured tables, loads a TSV file into one of them
//! and optionally runs an aggregate query over the result.
//!
//! Configuration is layered (in precedence order): defaults, config file, environment
//! variables (`STRATA_*`), and CLI flags.

use std::fs::File as FsFile;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::{Config, Environment, File};
use strata::query::QuerySpec;
use strata::schema::{TableConfig, TableSchema};
use strata::telemetry::{noop_event_listener, DbEvent, DbEventListener};
use strata::{DbConfig, DbCore};

// ---------- CLI ----------

/// Load tab-separated rows into an in-memory strata table and query it.
#[derive(Parser, Debug)]
#[command(name = "strata-load", version, about)]
pub struct Cli {
    /// Path to config file (TOML) with `[[tables]]` definitions.
    #[arg(long, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the resolved tables, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Target table for `--input`.
    #[arg(long, env = "STRATA_TABLE")]
    pub table: Option<String>,

    /// TSV file to load; `-` reads standard input.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Column names of the TSV file, comma separated. Defaults to schema order.
    #[arg(long, value_delimiter = ',')]
    pub columns: Option<Vec<String>>,

    /// Query file (TOML) run after loading.
    #[arg(long)]
    pub query: Option<PathBuf>,

    /// Print the generated filter code of `--query` before running it.
    #[arg(long, default_value_t = false)]
    pub explain: bool,

    /// Override the default segment size.
    #[arg(long, env = "STRATA_SEGMENT_SIZE")]
    pub segment_size: Option<usize>,

    /// Print structured events to stderr.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

// ---------- File/env config ----------

/// Top-level config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct LoaderFileConfig {
    pub segment_size: Option<usize>,
    pub updates_before_optimize: Option<u64>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Forwards events to stderr, one line each.
#[derive(Debug)]
struct StderrEventListener;

impl DbEventListener for StderrEventListener {
    fn on_event(&self, event: DbEvent) {
        eprintln!("event: {:?}", event);
    }
}

/// Load merged config. CLI overrides file/env.
fn load_config(cli: &Cli) -> Result<DbConfig, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("strata.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("STRATA")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: LoaderFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut db_config = DbConfig {
        event_listener: if cli.verbose {
            Arc::new(StderrEventListener)
        } else {
            noop_event_listener()
        },
        ..DbConfig::default()
    };
    if let Some(n) = partial.segment_size {
        db_config.segment_size = n;
    }
    if let Some(n) = partial.updates_before_optimize {
        db_config.updates_before_optimize = n;
    }
    if let Some(n) = cli.segment_size {
        db_config.segment_size = n;
    }
    db_config.tables = partial.tables;
    Ok(db_config)
}

fn open_input(path: &PathBuf) -> Result<Box<dyn BufRead>, String> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = FsFile::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    Ok(Box::new(BufReader::new(file)))
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let db_config = load_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("segment_size={}", db_config.segment_size);
        println!("updates_before_optimize={}", db_config.updates_before_optimize);
        for table in &db_config.tables {
            let schema = TableSchema::from_config(table, db_config.segment_size).map_err(|e| {
                eprintln!("config error: {}", e);
                e
            })?;
            println!(
                "table={} dimensions={} metrics={} segment_size={} fields={}",
                schema.name,
                schema.dimensions.len(),
                schema.metrics.len(),
                schema.segment_size,
                schema.field_count()
            );
        }
        return Ok(());
    }

    let db = DbCore::with_config(db_config).map_err(|e| {
        eprintln!("failed to create tables: {}", e);
        e
    })?;

    if let Some(ref input) = cli.input {
        let name = match (&cli.table, db.table_names()?.as_slice()) {
            (Some(name), _) => name.clone(),
            (None, [only]) => only.clone(),
            (None, _) => return Err("--table is required when several tables are configured".into()),
        };
        let table = db.table(&name)?;
        let reader = open_input(input)?;
        let report = table.load_tsv(reader, cli.columns.as_deref())?;
        for rejected in &report.rejected {
            eprintln!("row {}: {}", rejected.row + 1, rejected.error);
        }
        eprintln!(
            "loaded table={} rows={} new={} merged={} rejected={}",
            name,
            report.stats.rows,
            report.stats.new_recs,
            report.stats.merged_recs,
            report.rejected.len()
        );
    }

    if let Some(ref path) = cli.query {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let (table_name, query) = QuerySpec::from_toml_str(&text)?.into_query()?;
        let table = db.table(&table_name)?;
        if cli.explain {
            if let Some(ref filter) = query.filter {
                eprintln!("{}", table.explain(filter)?);
            }
        }
        let result = table.query(&query)?;

        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", result.columns.join("\t"))?;
        for row in &result.rows {
            writeln!(out, "{}", row.join("\t"))?;
        }
        eprintln!(
            "query time {} ms (ss={},sk={},sr={},ar={},or={})",
            result.stats.elapsed.as_millis(),
            result.stats.scanned_segments,
            result.stats.skipped_segments,
            result.stats.scanned_records,
            result.stats.aggregated_records,
            result.stats.output_records
        );
    }
    Ok(())
}
