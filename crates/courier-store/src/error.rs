use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The platform reported no home/data directory.
    #[error("no data directory available for the message log")]
    NoDataDir,

    #[error("creating data directory: {0}")]
    Io(#[from] std::io::Error),

    /// A lookup by id matched no row.
    #[error("not found")]
    NotFound,

    #[error("schema migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
