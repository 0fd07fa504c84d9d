//! Error types for meridian

/// Result type alias for meridian operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for meridian
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Server is already open
    #[error("server already open")]
    ServerOpen,
    /// Server is closed
    #[error("server closed")]
    ServerClosed,
    /// A data path is required to open the server
    #[error("path required")]
    PathRequired,
    /// The join handshake with the peer failed
    #[error("unable to join")]
    UnableToJoin,
    /// Data node creation requires a URL
    #[error("data node url required")]
    DataNodeUrlRequired,
    /// A data node with the same URL already exists
    #[error("data node exists")]
    DataNodeExists,
    /// Data node not found
    #[error("data node not found")]
    DataNodeNotFound,
    /// Database already exists
    #[error("database exists")]
    DatabaseExists,
    /// Database not found
    #[error("database not found")]
    DatabaseNotFound,
    /// Retention policy creation requires a name
    #[error("retention policy name required")]
    RetentionPolicyNameRequired,
    /// Retention policy already exists
    #[error("retention policy exists")]
    RetentionPolicyExists,
    /// Retention policy not found
    #[error("retention policy not found")]
    RetentionPolicyNotFound,
    /// No default retention policy set for the database
    #[error("default retention policy not found")]
    DefaultRetentionPolicyNotFound,
    /// Shard not found
    #[error("shard not found")]
    ShardNotFound,
    /// Measurement not found
    #[error("measurement not found")]
    MeasurementNotFound,
    /// Series not found
    #[error("series not found")]
    SeriesNotFound,
    /// User creation requires a username
    #[error("username required")]
    UsernameRequired,
    /// User already exists
    #[error("user exists")]
    UserExists,
    /// User not found
    #[error("user not found")]
    UserNotFound,
    /// A measurement has run out of field identifiers
    #[error("field overflow")]
    FieldOverflow,
    /// Statement skipped because a prior statement failed
    #[error("not executed")]
    NotExecuted,
    /// Authentication failed
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Measurement name could not be normalized
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),
    /// Broker error
    #[error("broker error: {0}")]
    Broker(String),
    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
    /// Metastore / shard store errors
    #[error("store error: {0}")]
    Store(#[from] redb::Error),
    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Password hashing errors
    #[error("hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    /// HTTP client errors (join flow)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Store(e.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Store(e.into())
    }
}
