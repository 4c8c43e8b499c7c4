use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[cfg(feature = "sqlite")]
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[cfg(feature = "sqlite")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Stored command `{id}` cannot be decoded: {reason}")]
    CorruptRow { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Failures raised while building or consulting the type registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command class `{0}` registered twice")]
    DuplicateClass(String),

    #[error("precondition `{0}` registered twice")]
    DuplicatePrecondition(String),

    #[error("command type `{0}` is not registered")]
    UnregisteredType(String),

    #[error("command `{command}` declares unknown precondition `{precondition}`")]
    UnknownPrecondition {
        command: String,
        precondition: String,
    },
}
