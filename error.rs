use thiserror::Error;

/// Errors surfaced by every SecureVFS operation.
///
/// Each variant maps to one failure class so callers can tell a password
/// retry apart from corruption or a permission problem.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Bad credentials, no active session, or no key loaded
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The record exists but belongs to another user
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Frame magic, version, algorithm or header length is invalid
    #[error("Format error: {0}")]
    Format(String),

    /// AEAD tag mismatch or plaintext checksum mismatch
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Compression or decompression failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Database failures (constraint violations, I/O inside SQLite)
    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Local filesystem errors during import/export
    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse classification of a [`VfsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    Format,
    Integrity,
    Codec,
    Store,
    NotFound,
    Io,
}

pub type Result<T> = std::result::Result<T, VfsError>;

impl VfsError {
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Format(_) => ErrorKind::Format,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Store(_) => ErrorKind::Store,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for VfsError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}
