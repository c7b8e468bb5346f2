//! Error taxonomy of the store layer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the store layer.
///
/// Cardinality-dependent operations never succeed silently: they report one of
/// these variants and leave the database untouched.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value '{value}' cannot be converted to {kind}")]
    Conversion { value: String, kind: String },
    #[error("unsupported return type '{0}'")]
    UnsupportedType(String),
    #[error("a record matching {col} = {val} already exists in table '{table}'")]
    DuplicateRecord {
        table: String,
        col: String,
        val: String,
    },
    #[error("table '{table}' in database '{database}' expects values for columns {expected:?}, got {actual:?}")]
    SchemaMismatch {
        database: String,
        table: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("no record matching {col} = {val} in table '{table}'")]
    MissingParent {
        table: String,
        col: String,
        val: String,
    },
    #[error("expected exactly one matching row in '{table}', found {found}")]
    Cardinality { table: String, found: u64 },
    #[error("query against '{0}' returned no value")]
    EmptyResult(String),
    #[error("table '{table}' does not exist in database '{database}'")]
    MissingTable { database: String, table: String },
    #[error("no hierarchy tier is keyed by '{query_index}' in database '{database}'")]
    UnknownTier {
        database: String,
        query_index: String,
    },
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("failed to prepare database directory {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn conversion(value: impl Into<String>, kind: impl ToString) -> Self {
        StoreError::Conversion {
            value: value.into(),
            kind: kind.to_string(),
        }
    }

    /// True for errors that mean "nothing was found" rather than a fault.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, StoreError::EmptyResult(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
