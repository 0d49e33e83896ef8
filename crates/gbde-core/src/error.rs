use thiserror::Error;

pub type BdeResult<T> = Result<T, BdeError>;

#[derive(Debug, Error)]
pub enum BdeError {
    /// No lock copy decrypted and verified under the supplied secret.
    #[error("could not recover key: no lock copy verified")]
    KeyNotFound,

    #[error("lock format error: {0}")]
    Format(String),

    #[error("request out of range: offset {offset} length {length} (media limit {limit})")]
    OutOfRange { offset: u64, length: u64, limit: u64 },

    #[error("misaligned request: offset {offset} length {length} (sector size {sector_size})")]
    Misaligned {
        offset: u64,
        length: u64,
        sector_size: u32,
    },

    #[error("I/O error on sector at {offset}: {message}")]
    SectorIo {
        offset: u64,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("device is gone")]
    Gone,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BdeError {
    /// Build a sector-scoped error from a backing I/O failure.
    pub fn sector_io(offset: u64, err: &std::io::Error) -> Self {
        BdeError::SectorIo {
            offset,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Produce an owned copy for fan-out to several requests.
    ///
    /// Variants wrapping non-cloneable sources are flattened into `Other`.
    pub fn duplicate(&self) -> Self {
        match self {
            BdeError::KeyNotFound => BdeError::KeyNotFound,
            BdeError::Format(s) => BdeError::Format(s.clone()),
            BdeError::OutOfRange {
                offset,
                length,
                limit,
            } => BdeError::OutOfRange {
                offset: *offset,
                length: *length,
                limit: *limit,
            },
            BdeError::Misaligned {
                offset,
                length,
                sector_size,
            } => BdeError::Misaligned {
                offset: *offset,
                length: *length,
                sector_size: *sector_size,
            },
            BdeError::SectorIo {
                offset,
                kind,
                message,
            } => BdeError::SectorIo {
                offset: *offset,
                kind: *kind,
                message: message.clone(),
            },
            BdeError::Gone => BdeError::Gone,
            BdeError::Config(s) => BdeError::Config(s.clone()),
            BdeError::Io(e) => BdeError::Io(std::io::Error::new(e.kind(), e.to_string())),
            BdeError::Other(e) => BdeError::Other(anyhow::anyhow!("{e:#}")),
        }
    }
}
