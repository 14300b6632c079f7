use thiserror::Error;

/// Crate-wide error type. Variants are error *kinds*, not call-site
/// specific — callers match on the kind to decide whether to retry,
/// surface to the user, or treat the engine as unrecoverable.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("bson serialization error: {0}")]
    BsonSer(#[from] bson::ser::Error),

    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("no such index: {0}")]
    NoSuchIndex(String),

    #[error("duplicate key in unique index {index}")]
    DuplicateKey { index: String },

    #[error("key type mismatch for index {index}: expected {expected:?}, got {actual:?}")]
    KeyTypeMismatch { index: String, expected: crate::key::KeyType, actual: crate::key::KeyType },

    #[error("document is missing indexed field {field}")]
    MissingIndexedField { field: String },

    #[error("WAL corruption: {0}")]
    Corruption(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("transaction already committed or aborted")]
    TxAlreadyClosed,
}

pub type DbResult<T> = Result<T, DbError>;
