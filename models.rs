//! Plain records exchanged between the store, the pipeline and callers.

use crate::compression::CompressionAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type FileId = i64;
pub type DirectoryId = i64;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip)]
    pub password_hash: Vec<u8>,
    #[serde(skip)]
    pub salt: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Stored bytes of a file. Exactly one slot exists at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// Plaintext, or compressed plaintext
    Plain(Vec<u8>),
    /// An encrypted frame
    Encrypted(Vec<u8>),
}

impl FileContent {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Plain(b) | Self::Encrypted(b) => b,
        }
    }

    pub fn stored_len(&self) -> usize {
        self.bytes().len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub filename: String,
    pub path: String,
    pub user_id: UserId,
    pub mime_type: String,
    /// Plaintext length in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(skip)]
    pub content: FileContent,
    /// Algorithm actually applied before storage, if any
    pub compression: Option<CompressionAlgorithm>,
    /// SHA-256 of the original plaintext
    pub checksum: Vec<u8>,
}

impl FileRecord {
    pub fn is_encrypted(&self) -> bool {
        self.content.is_encrypted()
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }
}

/// Insert payload for [`crate::store::Store::create_file`].
#[derive(Debug, Clone)]
pub struct NewFile {
    pub filename: String,
    pub path: String,
    pub user_id: UserId,
    pub mime_type: String,
    pub size: u64,
    pub content: FileContent,
    pub compression: Option<CompressionAlgorithm>,
    pub checksum: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: DirectoryId,
    pub name: String,
    pub path: String,
    pub parent_id: Option<DirectoryId>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDirectory {
    pub name: String,
    pub path: String,
    pub parent_id: Option<DirectoryId>,
    pub user_id: UserId,
}

/// Per-user usage figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Sum of plaintext sizes
    pub total_bytes: u64,
    pub file_count: u64,
    pub directory_count: u64,
}
