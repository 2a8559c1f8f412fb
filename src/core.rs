//! Core database logic: table catalog, the shared dictionary registry and the load/query
//! entry points.

use crate::dictionary::Dictionaries;
use crate::error::DbError;
use crate::query::{AggregateQuery, QueryResult};
use crate::schema::{TableConfig, TableSchema, DEFAULT_SEGMENT_SIZE};
use crate::table::{LoadReport, Table};
use crate::telemetry::{noop_event_listener, DbEvent, DbEventListener};
use crate::upsert::DEFAULT_UPDATES_BEFORE_OPTIMIZE;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Configuration options for the DbCore
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Tables created by [`DbCore::with_config`].
    pub tables: Vec<TableConfig>,
    /// Segment capacity for tables that do not set their own.
    pub segment_size: usize,
    /// Merges between two optimize passes of bitset metrics and cardinality guards.
    pub updates_before_optimize: u64,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            tables: Vec::new(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            updates_before_optimize: DEFAULT_UPDATES_BEFORE_OPTIMIZE,
            event_listener: noop_event_listener(),
        }
    }
}

/// In-memory analytical store: a set of tables sharing one dictionary registry.
#[derive(Debug)]
pub struct DbCore {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Per-(table, dimension) dictionaries, created lazily at table setup.
    dictionaries: Arc<Dictionaries>,
    config: DbConfig,
}

impl DbCore {
    /// Creates a database and every table listed in `config.tables`.
    ///
    /// # Errors
    /// Returns the first schema error, or [`DbError::TableExists`] for duplicate names.
    pub fn with_config(config: DbConfig) -> Result<Self, DbError> {
        let db = DbCore {
            tables: RwLock::new(HashMap::new()),
            dictionaries: Arc::new(Dictionaries::new()),
            config,
        };
        for table in db.config.tables.clone() {
            db.create_table(&table)?;
        }
        Ok(db)
    }

    pub fn create_table(&self, config: &TableConfig) -> Result<Arc<Table>, DbError> {
        let schema = TableSchema::from_config(config, self.config.segment_size)?;
        let mut tables = self.tables.write()?;
        if tables.contains_key(&schema.name) {
            return Err(DbError::TableExists(schema.name));
        }
        let (dimensions, metrics) = (schema.dimensions.len(), schema.metrics.len());
        let table = Arc::new(Table::new(
            schema,
            Arc::clone(&self.dictionaries),
            self.config.event_listener.clone(),
            self.config.updates_before_optimize,
        )?);
        tables.insert(table.name().to_string(), Arc::clone(&table));
        drop(tables);

        self.config.event_listener.on_event(DbEvent::TableCreated {
            table: table.name().to_string(),
            dimensions,
            metrics,
        });
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<Table>, DbError> {
        self.tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Table names, sorted.
    pub fn table_names(&self) -> Result<Vec<String>, DbError> {
        let mut names: Vec<String> = self.tables.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn load<R, S>(
        &self,
        table: &str,
        rows: impl IntoIterator<Item = R>,
    ) -> Result<LoadReport, DbError>
    where
        R: AsRef<[S]>,
        S: AsRef<str>,
    {
        self.table(table)?.load(rows)
    }

    pub fn query(&self, table: &str, query: &AggregateQuery) -> Result<QueryResult, DbError> {
        self.table(table)?.query(query)
    }

    pub fn dictionaries(&self) -> &Dictionaries {
        &self.dictionaries
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }
}
