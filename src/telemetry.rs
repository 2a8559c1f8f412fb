use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

use crate::query::QueryStats;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers can provide an implementation that forwards these events to
/// `tracing`, `log`, metrics, or custom sinks.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the core.
#[derive(Debug, Clone)]
pub enum DbEvent {
    TableCreated {
        table: String,
        dimensions: usize,
        metrics: usize,
    },

    BatchLoaded {
        table: String,
        rows: u64,
        new_records: u64,
        merged_records: u64,
        elapsed: Duration,
    },
    /// A row failed to parse and was not stored. `row` is its position in the batch.
    RowRejected {
        table: String,
        row: usize,
        error: String,
    },

    /// A new string value did not fit the dimension's cardinality and was stored as code 0.
    DictionaryOverflow {
        table: String,
        dimension: String,
        value: String,
    },
    CardinalityGuardApplied {
        table: String,
        dimension: String,
    },
    Optimized {
        table: String,
        duration: Duration,
    },

    QueryCompleted {
        table: String,
        stats: QueryStats,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is effectively a no-op until a recorder is installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
/// - Every series carries a `table` label.
pub mod db_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Notes:
    // - Counters are exposed as `<name>_total` by the Prometheus exporter.
    // - Histograms are exposed as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const UPSERT_ROWS: &str = "strata_upsert_rows";
    pub const UPSERT_NEW_RECORDS: &str = "strata_upsert_new_records";
    pub const UPSERT_MERGED_RECORDS: &str = "strata_upsert_merged_records";
    pub const DICTIONARY_OVERFLOWS: &str = "strata_dictionary_overflows";
    pub const GUARD_SUBSTITUTIONS: &str = "strata_guard_substitutions";
    pub const OPTIMIZE_DURATION_SECONDS: &str = "strata_optimize_duration_seconds";

    pub const QUERY_DURATION_SECONDS: &str = "strata_query_duration_seconds";
    pub const QUERY_SCANNED_SEGMENTS: &str = "strata_query_scanned_segments";
    pub const QUERY_SKIPPED_SEGMENTS: &str = "strata_query_skipped_segments";
    pub const QUERY_OUTPUT_ROWS: &str = "strata_query_output_rows";

    pub const DICTIONARY_SIZE: &str = "strata_dictionary_size";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        ///
        /// The upkeep thread periodically calls `run_upkeep()`, which `install_recorder` requires
        /// for histogram maintenance.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("strata-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    fn increment(name: &'static str, table: &str, n: u64) {
        if n > 0 {
            ::metrics::counter!(name, "table" => table.to_string()).increment(n);
        }
    }

    pub fn record_upsert_batch(table: &str, stats: &crate::upsert::UpsertStats) {
        increment(UPSERT_ROWS, table, stats.rows);
        increment(UPSERT_NEW_RECORDS, table, stats.new_recs);
        increment(UPSERT_MERGED_RECORDS, table, stats.merged_recs);
        increment(DICTIONARY_OVERFLOWS, table, stats.dictionary_overflows);
        increment(GUARD_SUBSTITUTIONS, table, stats.guard_substitutions);
    }

    #[inline]
    pub fn record_optimize(table: &str, duration: Duration) {
        ::metrics::histogram!(OPTIMIZE_DURATION_SECONDS, "table" => table.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn record_query(table: &str, stats: &QueryStats) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS, "table" => table.to_string())
            .record(stats.elapsed.as_secs_f64());
        increment(QUERY_SCANNED_SEGMENTS, table, stats.scanned_segments as u64);
        increment(QUERY_SKIPPED_SEGMENTS, table, stats.skipped_segments as u64);
        increment(QUERY_OUTPUT_ROWS, table, stats.output_records as u64);
    }

    #[inline]
    pub fn record_dictionary_size(table: &str, dimension: &str, size: usize) {
        ::metrics::gauge!(
            DICTIONARY_SIZE,
            "table" => table.to_string(),
            "dimension" => dimension.to_string()
        )
        .set(size as f64);
    }

    fn describe_all() {
        // Counters
        describe_counter!(UPSERT_ROWS, Unit::Count, "Rows processed by Table::load.");
        describe_counter!(
            UPSERT_NEW_RECORDS,
            Unit::Count,
            "Rows whose dimension tuple was new and got appended to the store."
        );
        describe_counter!(
            UPSERT_MERGED_RECORDS,
            Unit::Count,
            "Rows merged into an existing record with the same dimension tuple."
        );
        describe_counter!(
            DICTIONARY_OVERFLOWS,
            Unit::Count,
            "String values stored as the overflow code because the dictionary was full."
        );
        describe_counter!(
            GUARD_SUBSTITUTIONS,
            Unit::Count,
            "Values replaced with the overflow code by a cardinality guard."
        );
        describe_counter!(QUERY_SCANNED_SEGMENTS, Unit::Count, "Segments scanned record by record.");
        describe_counter!(
            QUERY_SKIPPED_SEGMENTS,
            Unit::Count,
            "Segments excluded by the segment-skip predicate."
        );
        describe_counter!(QUERY_OUTPUT_ROWS, Unit::Count, "Result rows returned by aggregate queries.");

        // Histograms
        describe_histogram!(
            OPTIMIZE_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent compacting bitset metrics and guard sets."
        );
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Aggregate query execution time."
        );

        // Gauges
        describe_gauge!(
            DICTIONARY_SIZE,
            Unit::Count,
            "Number of distinct values held by a string dimension's dictionary."
        );
    }
}
