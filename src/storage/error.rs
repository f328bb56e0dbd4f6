use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    SledError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Corrupt queue entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::SledError(err.to_string())
    }
}
