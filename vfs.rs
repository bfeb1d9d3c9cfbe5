//! The virtual file system facade.
//!
//! [`VfsManager`] ties the session key, the content pipeline and the store
//! together. Writes run compress-then-encrypt, reads run
//! decrypt-then-decompress and finish with a checksum check over the
//! recovered plaintext. Every file and directory operation is scoped to the
//! logged-in user.

use crate::compression::{self, CompressionAlgorithm};
use crate::encryptor::{self, CipherAlgorithm, Encryptor};
use crate::error::{Result, VfsError};
use crate::frame::FrameFlags;
use crate::key_manager::KeyManager;
use crate::models::{
    DirectoryId, DirectoryRecord, FileContent, FileId, FileRecord, NewDirectory, NewFile,
    StorageStats, User, UserId,
};
use crate::store::Store;
use chrono::Utc;
use std::path::Path;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Algorithms and level used when new content is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub encryption: CipherAlgorithm,
    pub compression: CompressionAlgorithm,
    pub compression_level: i32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            encryption: CipherAlgorithm::Aes256Gcm,
            compression: CompressionAlgorithm::Zlib,
            compression_level: 6,
        }
    }
}

/// Output of the write transform, ready to persist.
struct Sealed {
    content: FileContent,
    compression: Option<CompressionAlgorithm>,
    checksum: Vec<u8>,
}

pub struct VfsManager {
    store: Store,
    encryptor: Encryptor,
    session: Option<User>,
    settings: PipelineSettings,
}

impl VfsManager {
    pub fn new(store: Store) -> Self {
        Self::with_settings(store, PipelineSettings::default())
    }

    pub fn with_settings(store: Store, settings: PipelineSettings) -> Self {
        Self {
            store,
            encryptor: Encryptor::default(),
            session: None,
            settings,
        }
    }

    /// Open the database at `path` and wrap it.
    pub fn open(path: impl AsRef<Path>, settings: PipelineSettings) -> Result<Self> {
        Ok(Self::with_settings(Store::open(path)?, settings))
    }

    /// Switch to the database at `path`. The current session ends because
    /// user ids do not carry across databases. On failure the current
    /// database stays open and the session is kept.
    pub fn reopen_database(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let store = Store::open(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to reopen database");
            e
        })?;
        self.logout();
        self.store = store;
        info!(path = %path.display(), "database reopened");
        Ok(())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: PipelineSettings) {
        debug!(?settings, "pipeline settings updated");
        self.settings = settings;
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The session's encryptor, keyed while a user is logged in.
    pub fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    // ---------------------------------------------------------------------
    // Session
    // ---------------------------------------------------------------------

    pub fn create_user(&self, username: &str, password: &str) -> Result<UserId> {
        self.store.create_user(username, password)
    }

    /// Log in, replacing any current session, and load the user's key.
    pub fn authenticate(&mut self, username: &str, password: &str) -> Result<&User> {
        if self.session.is_some() {
            self.logout();
        }
        let user = self.store.authenticate_user(username, password)?;
        self.encryptor.keys_mut().load(password, &user.salt)?;
        info!(user_id = user.id, username, "logged in");
        Ok(&*self.session.insert(user))
    }

    pub fn logout(&mut self) {
        self.encryptor.keys_mut().clear();
        if let Some(user) = self.session.take() {
            info!(user_id = user.id, "logged out");
        }
    }

    pub fn current_user(&self) -> Option<&User> {
        self.session.as_ref()
    }

    fn require_user(&self) -> Result<&User> {
        self.session
            .as_ref()
            .ok_or_else(|| VfsError::authentication("no user logged in"))
    }

    /// Verify `old_password`, then re-key every encrypted file of the user
    /// and store the new password hash in one transaction.
    pub fn change_password(&mut self, old_password: &str, new_password: &str) -> Result<()> {
        let user = self.require_user()?.clone();
        self.store.authenticate_user(&user.username, old_password)?;

        let mut new_keys = KeyManager::new();
        new_keys.load(new_password, &user.salt)?;
        let new_encryptor = Encryptor::new(new_keys);

        let rekeyed = self.store.transaction(|store| {
            let mut count = 0usize;
            for mut record in store.list_user_files(user.id)? {
                let FileContent::Encrypted(frame) = &record.content else {
                    continue;
                };
                let opened = self.encryptor.decrypt_and_get_flags(frame)?;
                let frame = new_encryptor.encrypt_with_flags(
                    &opened.plaintext,
                    opened.algorithm,
                    opened.flags,
                )?;
                record.content = FileContent::Encrypted(frame);
                record.modified_at = Utc::now();
                store.update_file(&record)?;
                count += 1;
            }
            store.change_password(user.id, new_password)?;
            Ok(count)
        })?;

        self.encryptor = new_encryptor;
        info!(user_id = user.id, rekeyed, "password changed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Content pipeline
    // ---------------------------------------------------------------------

    fn seal(&self, plaintext: &[u8], encrypt: bool, compress: bool) -> Result<Sealed> {
        let checksum = encryptor::checksum(plaintext);

        let (payload, compression) = if compress {
            let algorithm = self.settings.compression.effective();
            let packed =
                compression::compress(plaintext, algorithm, self.settings.compression_level)?;
            debug!(
                algorithm = %algorithm,
                original = plaintext.len(),
                compressed = packed.len(),
                ratio = compression::ratio(plaintext, &packed),
                "compressed content"
            );
            (packed, Some(algorithm))
        } else {
            (plaintext.to_vec(), None)
        };

        let content = if encrypt {
            let flags = compression
                .map(FrameFlags::compressed_with)
                .unwrap_or_default();
            FileContent::Encrypted(self.encryptor.encrypt_with_flags(
                &payload,
                self.settings.encryption,
                flags,
            )?)
        } else {
            FileContent::Plain(payload)
        };

        Ok(Sealed {
            content,
            compression,
            checksum,
        })
    }

    fn unseal(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let plaintext = match &record.content {
            FileContent::Encrypted(frame) => {
                let opened = self.encryptor.decrypt_and_get_flags(frame)?;
                if opened.flags.compressed {
                    compression::decompress(&opened.plaintext, opened.flags.compression)?
                } else {
                    opened.plaintext
                }
            }
            FileContent::Plain(bytes) => match record.compression {
                Some(algorithm) => compression::decompress(bytes, algorithm)?,
                None => bytes.clone(),
            },
        };

        if !encryptor::verify_checksum(&plaintext, &record.checksum) {
            error!(file_id = record.id, "checksum mismatch");
            return Err(VfsError::integrity(format!(
                "checksum mismatch for file {}",
                record.id
            )));
        }
        Ok(plaintext)
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    fn owned_file(&self, file_id: FileId) -> Result<FileRecord> {
        let user = self.require_user()?;
        let record = self.store.get_file(file_id)?;
        if record.user_id != user.id {
            warn!(file_id, user_id = user.id, "access to foreign file denied");
            return Err(VfsError::authorization(format!(
                "file {file_id} belongs to another user"
            )));
        }
        Ok(record)
    }

    pub fn create_file(
        &self,
        filename: &str,
        path: &str,
        content: &[u8],
        encrypt: bool,
        compress: bool,
    ) -> Result<FileId> {
        let user_id = self.require_user()?.id;
        if filename.trim().is_empty() {
            return Err(VfsError::store("filename must not be empty"));
        }

        let sealed = self.seal(content, encrypt, compress)?;
        let id = self.store.create_file(&NewFile {
            filename: filename.to_string(),
            path: path.to_string(),
            user_id,
            mime_type: guess_mime(filename),
            size: content.len() as u64,
            content: sealed.content,
            compression: sealed.compression,
            checksum: sealed.checksum,
        })?;

        info!(file_id = id, filename, path, encrypt, compress, size = content.len(), "file created");
        Ok(id)
    }

    /// Replace the content, keeping the file's encrypt/compress choice.
    pub fn update_file(&self, file_id: FileId, content: &[u8]) -> Result<()> {
        let mut record = self.owned_file(file_id)?;
        let sealed = self.seal(content, record.is_encrypted(), record.is_compressed())?;

        record.content = sealed.content;
        record.compression = sealed.compression;
        record.checksum = sealed.checksum;
        record.size = content.len() as u64;
        record.modified_at = Utc::now();
        self.store.update_file(&record)?;

        info!(file_id, size = content.len(), "file updated");
        Ok(())
    }

    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        self.owned_file(file_id)?;
        self.store.delete_file(file_id)?;
        info!(file_id, "file deleted");
        Ok(())
    }

    /// Record with content still in stored form.
    pub fn get_file(&self, file_id: FileId) -> Result<FileRecord> {
        self.owned_file(file_id)
    }

    /// Original plaintext of a file.
    pub fn get_file_content(&self, file_id: FileId) -> Result<Vec<u8>> {
        let record = self.owned_file(file_id)?;
        let plaintext = self.unseal(&record)?;
        debug!(file_id, size = plaintext.len(), "file content read");
        Ok(plaintext)
    }

    /// Bring a file to the requested encrypt/compress state using the
    /// current settings.
    pub fn reprocess_file(&self, file_id: FileId, encrypt: bool, compress: bool) -> Result<()> {
        let mut record = self.owned_file(file_id)?;
        let plaintext = self.unseal(&record)?;
        let sealed = self.seal(&plaintext, encrypt, compress)?;

        record.content = sealed.content;
        record.compression = sealed.compression;
        record.checksum = sealed.checksum;
        record.size = plaintext.len() as u64;
        record.modified_at = Utc::now();
        self.store.update_file(&record)?;

        info!(file_id, encrypt, compress, "file reprocessed");
        Ok(())
    }

    pub fn list_files_in_directory(&self, path: &str) -> Result<Vec<FileRecord>> {
        let user_id = self.require_user()?.id;
        self.store.list_files_in_directory(path, user_id)
    }

    pub fn search_files(&self, query: &str) -> Result<Vec<FileRecord>> {
        let user_id = self.require_user()?.id;
        self.store.search_files(query, user_id)
    }

    // ---------------------------------------------------------------------
    // Directories
    // ---------------------------------------------------------------------

    fn owned_directory(&self, dir_id: DirectoryId) -> Result<DirectoryRecord> {
        let user = self.require_user()?;
        let dir = self.store.get_directory(dir_id)?;
        if dir.user_id != user.id {
            warn!(directory_id = dir_id, user_id = user.id, "access to foreign directory denied");
            return Err(VfsError::authorization(format!(
                "directory {dir_id} belongs to another user"
            )));
        }
        Ok(dir)
    }

    pub fn create_directory(
        &self,
        name: &str,
        path: &str,
        parent_id: Option<DirectoryId>,
    ) -> Result<DirectoryId> {
        let user_id = self.require_user()?.id;
        if name.trim().is_empty() {
            return Err(VfsError::store("directory name must not be empty"));
        }
        if let Some(parent) = parent_id {
            self.owned_directory(parent)?;
        }

        let id = self.store.create_directory(&NewDirectory {
            name: name.to_string(),
            path: path.to_string(),
            parent_id,
            user_id,
        })?;
        info!(directory_id = id, name, path, "directory created");
        Ok(id)
    }

    pub fn delete_directory(&self, dir_id: DirectoryId) -> Result<()> {
        self.owned_directory(dir_id)?;
        self.store.delete_directory(dir_id)?;
        info!(directory_id = dir_id, "directory deleted");
        Ok(())
    }

    pub fn list_directories_in_path(&self, path: &str) -> Result<Vec<DirectoryRecord>> {
        let user_id = self.require_user()?.id;
        self.store.list_directories_in_path(path, user_id)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let user_id = self.require_user()?.id;
        self.store.storage_stats(user_id)
    }

    // ---------------------------------------------------------------------
    // Local file system bridge
    // ---------------------------------------------------------------------

    /// Read a local file and store it under `vfs_path` with its own name.
    pub async fn import_file(
        &self,
        local: impl AsRef<Path>,
        vfs_path: &str,
        encrypt: bool,
        compress: bool,
    ) -> Result<FileId> {
        let local = local.as_ref();
        self.require_user()?;
        let filename = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VfsError::store(format!("no usable file name in {}", local.display())))?
            .to_string();

        let data = fs::read(local).await?;
        debug!(local = %local.display(), size = data.len(), "importing local file");
        self.create_file(&filename, vfs_path, &data, encrypt, compress)
    }

    /// Write the plaintext of a file to `local`; returns the bytes written.
    pub async fn export_file(&self, file_id: FileId, local: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        let data = self.get_file_content(file_id)?;
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(local, &data).await?;
        info!(file_id, local = %local.display(), size = data.len(), "file exported");
        Ok(data.len() as u64)
    }
}

fn guess_mime(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
