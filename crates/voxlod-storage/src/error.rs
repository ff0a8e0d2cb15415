/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record in the log is not valid.
    #[error("corrupt record at byte {offset}")]
    Corrupt {
        /// File offset of the bad record.
        offset: u64,
    },

    /// A thread panicked while holding the storage lock.
    #[error("storage lock poisoned")]
    Poisoned,
}
