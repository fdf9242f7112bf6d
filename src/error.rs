use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store busy after retrying")]
    Busy,
    #[error("store connection pool error: {0}")]
    Pool(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chunk {0} not found")]
    ChunkNotFound(i64),
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
