//! # SecureVFS - Encrypted Virtual File System
//!
//! SecureVFS stores files and directories as rows of a SQLite database.
//! Content can be compressed and/or encrypted under a key derived from the
//! owner's password before it is persisted.
//!
//! ## Features
//!
//! - **Authenticated encryption**: AES-256-GCM or ChaCha20-Poly1305 (AES-256-CBC readable for legacy frames)
//! - **Self-describing frames**: algorithm, IV, tag and compression flags travel with the ciphertext
//! - **Compression**: zlib, gzip, LZ4 and Zstd, applied before encryption
//! - **Integrity**: SHA-256 checksum of the plaintext verified on every read
//! - **Per-user isolation**: every file and directory is owned and access-checked
//!
//! ## Quick Start
//!
//! ```no_run
//! use securevfs::{store::Store, vfs::VfsManager};
//!
//! fn main() -> securevfs::Result<()> {
//!     let mut vfs = VfsManager::new(Store::open("./securevfs.db")?);
//!     vfs.create_user("alice", "pw1234")?;
//!     vfs.authenticate("alice", "pw1234")?;
//!
//!     let id = vfs.create_file("a.txt", "/", b"hello world", true, true)?;
//!     assert_eq!(vfs.get_file_content(id)?, b"hello world");
//!     Ok(())
//! }
//! ```
//!
//! ## Frame Format
//!
//! See [`frame`] for the byte layout. Only version 1 is read or written.

pub mod compression;
pub mod config;
pub mod encryptor;
pub mod error;
pub mod frame;
pub mod key_manager;
pub mod models;
pub mod store;
pub mod vfs;

// Re-export common types for convenience
pub use error::{ErrorKind, Result, VfsError};
pub use vfs::{PipelineSettings, VfsManager};
