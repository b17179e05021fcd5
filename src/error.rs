use thiserror::Error;

/// Custom error type for bootstrap operations.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Setup Error: {0}")]
    Setup(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error(
        "bootstrap range is not a multiple of block size: shard={shard}, start={start}, end={end}, block_size={block_size}"
    )]
    UnalignedRange {
        shard: u32,
        start: u64,
        end: u64,
        block_size: u64,
    },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<String>,
        timestamp: Option<u64>,
    },

    #[error("bootstrap cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for BootstrapError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BootstrapError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
