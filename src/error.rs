use thiserror::Error;

/// Custom error type for the column store core.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Unsupported dimension code size: {0} bytes")]
    UnsupportedCodeWidth(u8),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A time value matched neither the epoch nor any of the accepted textual patterns.
    #[error("Unrecognized time format: {value}")]
    InvalidTimeFormat { value: String },

    #[error("Invalid value for column {column}: {value:?}")]
    InvalidValue { column: String, value: String },

    #[error("Wrong number of fields in row: expected={expected}, actual={actual}")]
    RowArity { expected: usize, actual: usize },

    /// Filter passes disagreed on the positional argument contract.
    #[error("Filter argument mismatch at position {position}: {details}")]
    ArgumentMismatch { position: usize, details: String },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
