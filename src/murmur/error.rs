use std::fmt;

use thiserror::Error;

use crate::murmur::blobs::BlobStoreError;
use crate::murmur::database::DatabaseError;
use crate::murmur::messages::MessageStoreError;
use crate::murmur::subscriptions::SubscriptionError;

pub type Result<T> = core::result::Result<T, MurmurError>;

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input. Not retried.
    Validation,
    /// Transient; the caller may retry with backoff. State is not corrupted.
    StoreUnavailable,
    /// Terminal for the call that hit it.
    QuotaExceeded,
    /// Lookup miss.
    NotFound,
    /// The live feed dropped; re-subscribe with the last known cursor.
    SubscriptionLost,
    /// Anything that is neither the caller's fault nor transient.
    Internal,
}

/// The component that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Facade,
    Database,
    MessageStore,
    SubscriptionManager,
    BlobStore,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Facade => write!(f, "facade"),
            Component::Database => write!(f, "database"),
            Component::MessageStore => write!(f, "message_store"),
            Component::SubscriptionManager => write!(f, "subscription_manager"),
            Component::BlobStore => write!(f, "blob_store"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MurmurError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Message store error: {0}")]
    MessageStore(#[from] MessageStoreError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl MurmurError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MurmurError::Validation(_) => ErrorKind::Validation,
            MurmurError::Database(e) if e.is_unavailable() => ErrorKind::StoreUnavailable,
            MurmurError::MessageStore(e) => e.kind(),
            MurmurError::Subscription(e) => e.kind(),
            MurmurError::BlobStore(e) => e.kind(),
            MurmurError::Configuration(_)
            | MurmurError::LoggingSetup(_)
            | MurmurError::Filesystem(_)
            | MurmurError::Database(_)
            | MurmurError::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn component(&self) -> Component {
        match self {
            MurmurError::Database(_) => Component::Database,
            MurmurError::MessageStore(_) => Component::MessageStore,
            MurmurError::Subscription(_) => Component::SubscriptionManager,
            MurmurError::BlobStore(_) => Component::BlobStore,
            MurmurError::Validation(_)
            | MurmurError::Configuration(_)
            | MurmurError::LoggingSetup(_)
            | MurmurError::Filesystem(_)
            | MurmurError::Other(_) => Component::Facade,
        }
    }

    /// Only transient store failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }
}
