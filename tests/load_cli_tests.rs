//! TSV loading through the library and the `strata-load` binary: config file, env
//! overrides, column mapping and query output.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;
use strata::query::QuerySpec;
use strata::{DbConfig, DbCore, DbError, TableConfig};

const TABLES_TOML: &str = r#"
updates_before_optimize = 1000

[[tables]]
name = "events"

[[tables.dimensions]]
name = "country"

[[tables.dimensions]]
name = "event_name"
type = "string"
length = 20
cardinality = 1000

[[tables.metrics]]
name = "count"
type = "count"

[[tables.metrics]]
name = "revenue"
type = "double_sum"
"#;

const QUERY_TOML: &str = r#"
table = "events"
dimensions = ["country"]
metrics = ["count", "revenue"]

[filter]
op = "eq"
column = "event_name"
value = "purchase"
"#;

const EVENTS_TSV: &str = "US\tpurchase\t0.5\n\
US\tpurchase\t1.0\n\
IL\topen\t0\n\
\n\
US\topen\t3\n\
US\tpurchase\n";

fn write(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path.to_string_lossy().into_owned()
}

/// Run strata-load in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_strata_load(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_strata-load");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run strata-load");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

fn events_db() -> DbCore {
    let table = TableConfig::from_toml_str(
        r#"
name = "events"
dimensions = [{ name = "country" }, { name = "event_name", length = 20 }]
metrics = [{ name = "count", type = "count" }, { name = "revenue", type = "double_sum" }]
"#,
    )
    .unwrap();
    DbCore::with_config(DbConfig {
        tables: vec![table],
        ..DbConfig::default()
    })
    .unwrap()
}

#[test]
fn load_tsv_in_schema_order() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "events.tsv", EVENTS_TSV);

    let db = events_db();
    let table = db.table("events").unwrap();
    let report = table
        .load_tsv(BufReader::new(fs::File::open(&path).unwrap()), None)
        .unwrap();
    assert_eq!(report.stats.rows, 4);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].row, 4);

    let (name, query) = QuerySpec::from_toml_str(QUERY_TOML).unwrap().into_query().unwrap();
    let result = db.query(&name, &query).unwrap();
    assert_eq!(result.columns, vec!["country", "count", "revenue"]);
    assert_eq!(
        result.rows,
        vec![vec!["US".to_string(), "2".to_string(), "1.5".to_string()]]
    );
}

#[test]
fn load_tsv_with_column_mapping_ignores_extra_columns() {
    let db = events_db();
    let table = db.table("events").unwrap();
    let columns: Vec<String> = ["revenue", "source", "event_name", "country"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let input = "2.5\tweb\tpurchase\tDE\n0.5\tapp\tpurchase\tDE\n";
    let report = table.load_tsv(input.as_bytes(), Some(columns.as_slice())).unwrap();
    assert_eq!(report.stats.new_recs, 1);
    assert_eq!(report.stats.merged_recs, 1);

    let (_, query) = QuerySpec::from_toml_str(QUERY_TOML).unwrap().into_query().unwrap();
    let rows = table.query(&query).unwrap().rows;
    assert_eq!(rows, vec![vec!["DE".to_string(), "2".to_string(), "3".to_string()]]);

    let missing = vec!["country".to_string(), "revenue".to_string()];
    assert!(matches!(
        table.load_tsv("US\t1\n".as_bytes(), Some(missing.as_slice())),
        Err(DbError::Config(msg)) if msg.contains("event_name")
    ));
}

#[test]
fn cli_loads_and_queries() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "tables.toml", TABLES_TOML);
    let input = write(dir.path(), "events.tsv", EVENTS_TSV);
    let query = write(dir.path(), "query.toml", QUERY_TOML);

    let (ok, stdout, stderr) = run_strata_load(
        &["--config", &config, "--input", &input, "--query", &query],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert_eq!(stdout, "country\tcount\trevenue\nUS\t2\t1.5\n");
    assert!(stderr.contains("loaded table=events rows=4 new=3 merged=1 rejected=1"), "stderr: {}", stderr);
    assert!(stderr.contains("row 5:"), "stderr: {}", stderr);
}

#[test]
fn cli_column_mapping_and_explain() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "tables.toml", TABLES_TOML);
    let input = write(dir.path(), "events.tsv", "purchase\t2\tFR\npurchase\t4\tFR\n");
    let query = write(dir.path(), "query.toml", QUERY_TOML);

    let (ok, stdout, stderr) = run_strata_load(
        &[
            "--config",
            &config,
            "--table",
            "events",
            "--input",
            &input,
            "--columns",
            "event_name,revenue,country",
            "--query",
            &query,
            "--explain",
        ],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert_eq!(stdout, "country\tcount\trevenue\nFR\t2\t6\n");
    assert!(stderr.contains("filter: (dims._1==farg0)"), "stderr: {}", stderr);
}

#[test]
fn validate_config_reports_tables() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "tables.toml", TABLES_TOML);

    let (ok, stdout, stderr) = run_strata_load(&["--validate-config", "--config", &config], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("updates_before_optimize=1000"), "stdout: {}", stdout);
    assert!(
        stdout.contains("table=events dimensions=2 metrics=2 segment_size=65536 fields=3"),
        "stdout: {}",
        stdout
    );
}

#[test]
fn validate_config_env_overridden_by_cli() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "tables.toml", TABLES_TOML);

    let (ok, stdout, _) = run_strata_load(
        &["--validate-config", "--config", &config],
        &[("STRATA_SEGMENT_SIZE", "16")],
    );
    assert!(ok);
    assert!(stdout.contains("segment_size=16\n"), "stdout: {}", stdout);

    let (ok, stdout, _) = run_strata_load(
        &["--validate-config", "--config", &config, "--segment-size", "32"],
        &[("STRATA_SEGMENT_SIZE", "16")],
    );
    assert!(ok);
    assert!(stdout.contains("segment_size=32\n"), "CLI should win: {}", stdout);
}

#[test]
fn invalid_config_fails_validation() {
    let dir = TempDir::new().unwrap();
    let config = write(
        dir.path(),
        "tables.toml",
        "[[tables]]\nname = \"t\"\n\n[[tables.metrics]]\nname = \"m\"\ntype = \"double_avg\"\n",
    );
    let (ok, _, stderr) = run_strata_load(&["--validate-config", "--config", &config], &[]);
    assert!(!ok);
    assert!(stderr.contains("config error"), "stderr: {}", stderr);
    assert!(stderr.contains("double_avg"), "stderr: {}", stderr);

    let (ok, _, stderr) = run_strata_load(&["--validate-config", "--config", "/nonexistent/strata.toml"], &[]);
    assert!(!ok);
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}
