//! A table: schema, generated upsert program, segment store and ingestion context.

use crate::dictionary::{Dictionaries, DimensionDict};
use crate::error::DbError;
use crate::filter::Filter;
use crate::query::{execute_aggregate, explain_filter, AggregateQuery, QueryResult};
use crate::schema::TableSchema;
use crate::store::SegmentStore;
use crate::telemetry::{db_metrics, DbEvent, DbEventListener};
use crate::upsert::{UpsertContext, UpsertGenerator, UpsertProgram, UpsertStats};

use std::io::BufRead;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// A row that failed to parse during [`Table::load`].
#[derive(Debug)]
pub struct RejectedRow {
    /// Position in the batch, starting at 0.
    pub row: usize,
    pub error: DbError,
}

/// Outcome of one batch load.
#[derive(Debug)]
pub struct LoadReport {
    pub stats: UpsertStats,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug)]
pub struct Table {
    schema: Arc<TableSchema>,
    dicts: Arc<Dictionaries>,
    program: UpsertProgram,
    store: RwLock<SegmentStore>,
    /// Serializes writers; the upsert context assumes a single ingestion stream.
    writer: Mutex<UpsertContext>,
    events: Arc<dyn DbEventListener>,
}

impl Table {
    pub fn new(
        schema: TableSchema,
        dicts: Arc<Dictionaries>,
        events: Arc<dyn DbEventListener>,
        updates_before_optimize: u64,
    ) -> Result<Self, DbError> {
        let program = UpsertGenerator::new(&schema).generate()?;
        let context = program.setup(&dicts, events.clone(), updates_before_optimize)?;
        let store = SegmentStore::for_schema(&schema);
        Ok(Self {
            schema: Arc::new(schema),
            dicts,
            program,
            store: RwLock::new(store),
            writer: Mutex::new(context),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Upserts a batch of rows. Rows that fail to parse are reported and skipped; the rest
    /// of the batch is still applied.
    pub fn load<R, S>(&self, rows: impl IntoIterator<Item = R>) -> Result<LoadReport, DbError>
    where
        R: AsRef<[S]>,
        S: AsRef<str>,
    {
        let started = Instant::now();
        let mut ctx = self.writer.lock()?;
        let mut store = self.store.write()?;

        self.program.before_batch(&mut ctx);
        let mut rejected = Vec::new();
        for (pos, row) in rows.into_iter().enumerate() {
            if let Err(error) = self.program.process_row(&mut ctx, &mut store, row.as_ref()) {
                self.events.on_event(DbEvent::RowRejected {
                    table: self.schema.name.clone(),
                    row: pos,
                    error: error.to_string(),
                });
                rejected.push(RejectedRow { row: pos, error });
            }
        }
        let stats = self.program.after_batch(&mut ctx, &mut store);

        self.events.on_event(DbEvent::BatchLoaded {
            table: self.schema.name.clone(),
            rows: stats.rows,
            new_records: stats.new_recs,
            merged_records: stats.merged_recs,
            elapsed: started.elapsed(),
        });
        Ok(LoadReport { stats, rejected })
    }

    /// Loads tab-separated rows.
    ///
    /// Without `columns`, each line carries the input fields in schema order. With
    /// `columns`, the list names the file's columns; they are reordered into schema order
    /// and columns unknown to the table are ignored.
    pub fn load_tsv<B: BufRead>(
        &self,
        input: B,
        columns: Option<&[String]>,
    ) -> Result<LoadReport, DbError> {
        let mapping = match columns {
            Some(columns) => Some(self.column_mapping(columns)?),
            None => None,
        };
        let mut rows = Vec::new();
        for line in input.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let row: Vec<String> = match &mapping {
                Some(mapping) => mapping
                    .iter()
                    .map(|&pos| fields.get(pos).copied().unwrap_or_default().to_string())
                    .collect(),
                None => fields.iter().map(|f| f.to_string()).collect(),
            };
            rows.push(row);
        }
        self.load(rows)
    }

    /// File column position for each input field the schema expects.
    fn column_mapping(&self, columns: &[String]) -> Result<Vec<usize>, DbError> {
        let field_names = self
            .schema
            .dimensions
            .iter()
            .map(|d| d.name.as_str())
            .chain(
                self.schema
                    .metrics
                    .iter()
                    .filter(|m| m.reads_field())
                    .map(|m| m.name.as_str()),
            );
        field_names
            .map(|name| {
                columns.iter().position(|c| c == name).ok_or_else(|| {
                    DbError::Config(format!(
                        "input columns of table {:?} do not include {:?}",
                        self.schema.name, name
                    ))
                })
            })
            .collect()
    }

    pub fn query(&self, query: &AggregateQuery) -> Result<QueryResult, DbError> {
        let store = self.store.read()?;
        let result = execute_aggregate(&self.schema, &self.dicts, &store, query)?;
        drop(store);

        db_metrics::record_query(&self.schema.name, &result.stats);
        self.events.on_event(DbEvent::QueryCompleted {
            table: self.schema.name.clone(),
            stats: result.stats.clone(),
        });
        Ok(result)
    }

    /// Generated predicate and skip-predicate sources for `filter`.
    pub fn explain(&self, filter: &Filter) -> Result<String, DbError> {
        let compiled = explain_filter(&self.schema, filter)?;
        Ok(format!(
            "{}\nfilter: {}\nskip: {}",
            compiled.unpack_source(),
            compiled.predicate_source(),
            compiled.skip_source()
        ))
    }

    pub fn dictionary(&self, dimension: &str) -> Result<Option<Arc<DimensionDict>>, DbError> {
        self.dicts.get(&self.schema.name, dimension)
    }

    /// Runs `f` with shared access to the store.
    pub fn with_store<T>(&self, f: impl FnOnce(&SegmentStore) -> T) -> Result<T, DbError> {
        let store = self.store.read()?;
        Ok(f(&store))
    }

    /// Runs `f` with shared access to the ingestion context.
    pub fn with_context<T>(&self, f: impl FnOnce(&UpsertContext) -> T) -> Result<T, DbError> {
        let ctx = self.writer.lock()?;
        Ok(f(&ctx))
    }

    pub fn record_count(&self) -> Result<usize, DbError> {
        self.with_store(SegmentStore::record_count)
    }

    pub fn segment_count(&self) -> Result<usize, DbError> {
        self.with_store(SegmentStore::segment_count)
    }
}
