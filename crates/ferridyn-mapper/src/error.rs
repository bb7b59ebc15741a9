//! Error types for all client operations.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Top-level error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("{context} failed: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("no such item")]
    NoSuchItem,

    #[error("only one batch registration per table is allowed: {0}")]
    DuplicateTableRegistration(String),
}

impl Error {
    /// Wrap a transport failure with the operation that issued it.
    pub(crate) fn transport(context: &'static str) -> impl FnOnce(TransportError) -> Error {
        move |source| Error::Transport { context, source }
    }

    /// The underlying transport failure, if this is one.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Error::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("invalid value placeholder: {0}")]
    InvalidPlaceholder(String),

    #[error("expression has {placeholders} value placeholder(s) but {values} value(s) were supplied")]
    ValueCountMismatch { placeholders: usize, values: usize },

    #[error("duplicate value placeholder: {0}")]
    DuplicatePlaceholder(String),

    #[error("invalid value for placeholder '{placeholder}': {reason}")]
    InvalidValue { placeholder: String, reason: String },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("table name must not be empty")]
    EmptyTableName,

    #[error("limit must be greater than zero")]
    InvalidLimit,

    #[error("invalid hash filter: {0}")]
    InvalidHashFilter(String),

    #[error("invalid range filter: {0}")]
    InvalidRangeFilter(String),

    #[error("no more items to return")]
    NoMoreItems,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid key schema: {0}")]
    InvalidKeySchema(String),

    #[error("incomplete primary key: missing or empty attribute '{0}'")]
    IncompleteKey(String),

    #[error("no valid key: neither the primary key nor any secondary index key is set")]
    NoValidKey,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("item must serialize to a map, got {0}")]
    NotAMap(&'static str),

    #[error("invalid number attribute: {0}")]
    InvalidNumber(String),

    #[error("key encoding error: {0}")]
    KeyEncoding(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("table has no stream enabled: {0}")]
    NotEnabled(String),

    #[error("no more records to return")]
    NoMoreRecords,
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("server disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("shard iterator expired: {0}")]
    ExpiredIterator(String),

    #[error("service error: {code}: {message}")]
    Service { code: String, message: String },
}

impl TransportError {
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, TransportError::ResourceNotFound(_))
    }
}

/// Failure of a single item inside a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid item: {0}")]
    Codec(String),

    #[error("item not found")]
    NotFound,

    #[error("item left unprocessed after {attempts} attempt(s)")]
    Unprocessed { attempts: usize },
}

/// Per-item failures of a batch operation, keyed by table and then by the
/// position of the item in the slice registered for that table.
///
/// An empty `BatchError` is never returned: `run()` yields `Ok(())` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchError {
    errors: BTreeMap<String, BTreeMap<usize, ItemError>>,
}

impl BatchError {
    pub(crate) fn insert(&mut self, table: &str, index: usize, err: ItemError) {
        self.errors
            .entry(table.to_string())
            .or_default()
            .insert(index, err);
    }

    /// The error recorded for `table[index]`, if any.
    pub fn get(&self, table: &str, index: usize) -> Option<&ItemError> {
        self.errors.get(table).and_then(|t| t.get(&index))
    }

    /// All errors recorded for one table.
    pub fn table(&self, table: &str) -> Option<&BTreeMap<usize, ItemError>> {
        self.errors.get(table)
    }

    /// Total number of failed items across all tables.
    pub fn len(&self) -> usize {
        self.errors.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.values().all(BTreeMap::is_empty)
    }

    /// Iterate over `(table, index, error)` triples in table then index order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &ItemError)> {
        self.errors.iter().flat_map(|(table, errs)| {
            errs.iter()
                .map(move |(idx, err)| (table.as_str(), *idx, err))
        })
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an error occurred in {} batch item(s)", self.len())
    }
}

impl std::error::Error for BatchError {}

pub type Result<T> = std::result::Result<T, Error>;
