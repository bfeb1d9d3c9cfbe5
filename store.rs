//! SQLite persistence for users, directories and files.
//!
//! Every statement is parameterised. Each public call is one logical
//! mutation; multi-step updates go through [`Store::transaction`].

use crate::compression::CompressionAlgorithm;
use crate::error::{Result, VfsError};
use crate::key_manager::generate_salt;
use crate::models::{
    DirectoryId, DirectoryRecord, FileContent, FileId, FileRecord, NewDirectory, NewFile,
    StorageStats, User, UserId,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use sha2::Sha256;
use std::path::Path;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const USER_COLUMNS: &str =
    "id, username, password_hash, salt, created_at, last_login, is_active";

const FILE_COLUMNS: &str = "id, filename, path, content, encrypted_content, mime_type, size, \
     created_at, modified_at, user_id, is_encrypted, is_compressed, compression_algorithm, checksum";

const DIRECTORY_COLUMNS: &str = "id, name, path, parent_id, user_id, created_at, modified_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        username      TEXT UNIQUE NOT NULL,
        password_hash BLOB NOT NULL,
        salt          BLOB NOT NULL,
        created_at    TEXT NOT NULL,
        last_login    TEXT,
        is_active     INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS directories (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL,
        path        TEXT NOT NULL,
        parent_id   INTEGER REFERENCES directories(id) ON DELETE SET NULL,
        user_id     INTEGER NOT NULL REFERENCES users(id),
        created_at  TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS files (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        filename              TEXT NOT NULL,
        path                  TEXT NOT NULL,
        content               BLOB,
        encrypted_content     BLOB,
        mime_type             TEXT,
        size                  INTEGER NOT NULL,
        created_at            TEXT NOT NULL,
        modified_at           TEXT NOT NULL,
        user_id               INTEGER NOT NULL REFERENCES users(id),
        is_encrypted          INTEGER NOT NULL DEFAULT 0,
        is_compressed         INTEGER NOT NULL DEFAULT 0,
        compression_algorithm TEXT,
        checksum              BLOB NOT NULL,
        CHECK ((is_encrypted = 1 AND encrypted_content IS NOT NULL AND content IS NULL)
            OR (is_encrypted = 0 AND content IS NOT NULL AND encrypted_content IS NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
    CREATE INDEX IF NOT EXISTS idx_files_user_id ON files(user_id);
    CREATE INDEX IF NOT EXISTS idx_directories_path ON directories(path);
    CREATE INDEX IF NOT EXISTS idx_directories_user_id ON directories(user_id);
";

/// Handle to the SQLite database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` inside a single transaction; any error rolls everything back.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    pub fn create_user(&self, username: &str, password: &str) -> Result<UserId> {
        if username.trim().is_empty() {
            return Err(VfsError::store("username must not be empty"));
        }
        if password.is_empty() {
            return Err(VfsError::authentication("password must not be empty"));
        }

        let salt = generate_salt();
        let hash = hash_password(password, &salt)?;
        let inserted = self.conn.execute(
            "INSERT INTO users (username, password_hash, salt, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![username, hash, salt.as_slice(), Utc::now()],
        );
        match inserted {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                info!(user_id = id, username, "user created");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                warn!(username, "username already taken");
                Err(VfsError::store(format!("user '{username}' already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify credentials of an active user and stamp the login time.
    pub fn authenticate_user(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1 AND is_active = 1"),
                params![username],
                user_from_row,
            )
            .optional()?;

        let Some(mut user) = user else {
            debug!(username, "unknown or inactive user");
            return Err(VfsError::authentication("invalid username or password"));
        };
        if !verify_password(password, &user.password_hash, &user.salt)? {
            debug!(username, "password mismatch");
            return Err(VfsError::authentication("invalid username or password"));
        }

        self.update_last_login(user.id)?;
        user.last_login = Some(Utc::now());
        Ok(user)
    }

    pub fn update_last_login(&self, user_id: UserId) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![Utc::now(), user_id],
        )?;
        expect_one_row(n, "user", user_id)
    }

    /// Re-hash with the user's existing salt.
    pub fn change_password(&self, user_id: UserId, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(VfsError::authentication("password must not be empty"));
        }
        let salt: Vec<u8> = self
            .conn
            .query_row("SELECT salt FROM users WHERE id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| VfsError::not_found(format!("user {user_id}")))?;

        let hash = hash_password(new_password, &salt)?;
        let n = self.conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![hash, user_id],
        )?;
        expect_one_row(n, "user", user_id)?;
        info!(user_id, "password changed");
        Ok(())
    }

    /// Users are never deleted; they are deactivated.
    pub fn set_user_active(&self, user_id: UserId, active: bool) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![active, user_id],
        )?;
        expect_one_row(n, "user", user_id)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?
            .ok_or_else(|| VfsError::not_found(format!("user {user_id}")))
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    pub fn create_file(&self, file: &NewFile) -> Result<FileId> {
        let (content, encrypted) = content_columns(&file.content);
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO files (filename, path, content, encrypted_content, mime_type, size,
                                created_at, modified_at, user_id, is_encrypted, is_compressed,
                                compression_algorithm, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                file.filename,
                file.path,
                content,
                encrypted,
                file.mime_type,
                file.size as i64,
                now,
                file.user_id,
                file.content.is_encrypted(),
                file.compression.is_some(),
                file.compression.map(|c| c.name()),
                file.checksum,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(file_id = id, filename = %file.filename, "file row inserted");
        Ok(id)
    }

    pub fn update_file(&self, file: &FileRecord) -> Result<()> {
        let (content, encrypted) = content_columns(&file.content);
        let n = self.conn.execute(
            "UPDATE files SET filename = ?1, path = ?2, content = ?3, encrypted_content = ?4,
                              mime_type = ?5, size = ?6, modified_at = ?7, is_encrypted = ?8,
                              is_compressed = ?9, compression_algorithm = ?10, checksum = ?11
             WHERE id = ?12",
            params![
                file.filename,
                file.path,
                content,
                encrypted,
                file.mime_type,
                file.size as i64,
                file.modified_at,
                file.is_encrypted(),
                file.is_compressed(),
                file.compression.map(|c| c.name()),
                file.checksum,
                file.id,
            ],
        )?;
        expect_one_row(n, "file", file.id)
    }

    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        expect_one_row(n, "file", file_id)
    }

    pub fn get_file(&self, file_id: FileId) -> Result<FileRecord> {
        self.conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![file_id],
                file_from_row,
            )
            .optional()?
            .ok_or_else(|| VfsError::not_found(format!("file {file_id}")))
    }

    pub fn list_files_in_directory(&self, path: &str, user_id: UserId) -> Result<Vec<FileRecord>> {
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE path = ?1 AND user_id = ?2 ORDER BY filename"
            ),
            params![path, user_id],
        )
    }

    pub fn list_user_files(&self, user_id: UserId) -> Result<Vec<FileRecord>> {
        self.query_files(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE user_id = ?1 ORDER BY id"),
            params![user_id],
        )
    }

    /// Substring match over filename or path. `%` and `_` in `query` match literally.
    pub fn search_files(&self, query: &str, user_id: UserId) -> Result<Vec<FileRecord>> {
        let pattern = format!("%{}%", escape_like(query));
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE (filename LIKE ?1 ESCAPE '\\' OR path LIKE ?1 ESCAPE '\\') AND user_id = ?2
                 ORDER BY path, filename"
            ),
            params![pattern, user_id],
        )
    }

    fn query_files(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---------------------------------------------------------------------
    // Directories
    // ---------------------------------------------------------------------

    pub fn create_directory(&self, dir: &NewDirectory) -> Result<DirectoryId> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO directories (name, path, parent_id, user_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![dir.name, dir.path, dir.parent_id, dir.user_id, now],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(directory_id = id, name = %dir.name, "directory row inserted");
        Ok(id)
    }

    pub fn delete_directory(&self, dir_id: DirectoryId) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM directories WHERE id = ?1", params![dir_id])?;
        expect_one_row(n, "directory", dir_id)
    }

    pub fn get_directory(&self, dir_id: DirectoryId) -> Result<DirectoryRecord> {
        self.conn
            .query_row(
                &format!("SELECT {DIRECTORY_COLUMNS} FROM directories WHERE id = ?1"),
                params![dir_id],
                directory_from_row,
            )
            .optional()?
            .ok_or_else(|| VfsError::not_found(format!("directory {dir_id}")))
    }

    pub fn list_directories_in_path(
        &self,
        path: &str,
        user_id: UserId,
    ) -> Result<Vec<DirectoryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DIRECTORY_COLUMNS} FROM directories WHERE path = ?1 AND user_id = ?2 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![path, user_id], directory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---------------------------------------------------------------------
    // Statistics
    // ---------------------------------------------------------------------

    pub fn storage_stats(&self, user_id: UserId) -> Result<StorageStats> {
        let (total_bytes, file_count): (i64, i64) = self.conn.query_row(
            "SELECT COALESCE(SUM(size), 0), COUNT(*) FROM files WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let directory_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM directories WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(StorageStats {
            total_bytes: total_bytes as u64,
            file_count: file_count as u64,
            directory_count: directory_count as u64,
        })
    }
}

fn expect_one_row(n: usize, what: &str, id: i64) -> Result<()> {
    if n == 0 {
        Err(VfsError::not_found(format!("{what} {id}")))
    } else {
        Ok(())
    }
}

fn content_columns(content: &FileContent) -> (Option<&[u8]>, Option<&[u8]>) {
    match content {
        FileContent::Plain(b) => (Some(b.as_slice()), None),
        FileContent::Encrypted(b) => (None, Some(b.as_slice())),
    }
}

fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn hash_password(password: &str, salt: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|e| VfsError::store(format!("password hashing: {e}")))?;
    mac.update(password.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_password(password: &str, hash: &[u8], salt: &[u8]) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|e| VfsError::store(format!("password hashing: {e}")))?;
    mac.update(password.as_bytes());
    Ok(mac.verify_slice(hash).is_ok())
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        salt: row.get("salt")?,
        created_at: row.get("created_at")?,
        last_login: row.get("last_login")?,
        is_active: row.get("is_active")?,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let is_encrypted: bool = row.get("is_encrypted")?;
    let content = if is_encrypted {
        FileContent::Encrypted(row.get::<_, Option<Vec<u8>>>("encrypted_content")?.unwrap_or_default())
    } else {
        FileContent::Plain(row.get::<_, Option<Vec<u8>>>("content")?.unwrap_or_default())
    };

    // Rows without a recorded algorithm predate the column and used zlib
    let is_compressed: bool = row.get("is_compressed")?;
    let compression = if is_compressed {
        let idx = row.as_ref().column_index("compression_algorithm")?;
        match row.get::<_, Option<String>>(idx)? {
            None => Some(CompressionAlgorithm::Zlib),
            Some(name) => Some(name.parse::<CompressionAlgorithm>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })?),
        }
    } else {
        None
    };

    Ok(FileRecord {
        id: row.get("id")?,
        filename: row.get("filename")?,
        path: row.get("path")?,
        user_id: row.get("user_id")?,
        mime_type: row.get::<_, Option<String>>("mime_type")?.unwrap_or_default(),
        size: row.get::<_, i64>("size")? as u64,
        created_at: row.get("created_at")?,
        modified_at: row.get("modified_at")?,
        content,
        compression,
        checksum: row.get::<_, Option<Vec<u8>>>("checksum")?.unwrap_or_default(),
    })
}

fn directory_from_row(row: &Row<'_>) -> rusqlite::Result<DirectoryRecord> {
    Ok(DirectoryRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        parent_id: row.get("parent_id")?,
        user_id: row.get("user_id")?,
        created_at: row.get("created_at")?,
        modified_at: row.get("modified_at")?,
    })
}
