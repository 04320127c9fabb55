use thiserror::Error;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),

    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("corrupted record: {0}")]
    Corrupted(String),

    #[error("component payload error: {0}")]
    Payload(#[from] bincode::Error),
}
