use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaimsError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("claims store lock poisoned")]
    Poisoned,

    /// Reservations must outlive every instance's view of an occurrence.
    #[error("invalid reservation ttl: {secs}s (min 60s)")]
    InvalidTtl { secs: u64 },
}

pub type Result<T> = std::result::Result<T, ClaimsError>;
