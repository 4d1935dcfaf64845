//! On-disk catalog
//!
//! Two tables hold everything the engine persists:
//!
//! - `blocks`: one row per block (name, version, level rank, element count,
//!   and the JSON block format for dynamic blocks)
//! - `block_fields`: one row per (block, field) with the declared type tag,
//!   the encoded column of every element value, and the element count the
//!   column was encoded for
//!
//! Everything here works on a borrowed `rusqlite::Connection` so the same
//! functions run inside or outside a transaction (`Transaction` derefs to
//! `Connection`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use super::codec::FieldType;
use super::format::BlockFormat;
use super::level::PersistenceLevel;
use crate::config::StorageConfig;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    name    TEXT PRIMARY KEY NOT NULL,
    version INTEGER NOT NULL,
    level   INTEGER NOT NULL,
    count   INTEGER NOT NULL,
    format  TEXT
);
CREATE TABLE IF NOT EXISTS block_fields (
    block_name TEXT NOT NULL REFERENCES blocks(name),
    field_name TEXT NOT NULL,
    data_type  INTEGER NOT NULL,
    data       BLOB NOT NULL,
    count      INTEGER NOT NULL,
    PRIMARY KEY (block_name, field_name)
) WITHOUT ROWID;
";

/// Journal side-file suffixes of a database file
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Catalog row of one block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub name: String,
    pub version: u32,
    pub level: PersistenceLevel,
    pub count: usize,
    pub format: Option<BlockFormat>,
}

/// Row of one (block, field) pair
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRecord {
    pub block_name: String,
    pub field_name: String,
    pub field_type: FieldType,
    pub data: Vec<u8>,
    pub count: usize,
}

/// Opens configured connections to one database file.
///
/// Field reads and writes use a connection per operation; every connection
/// gets the encryption key first, then the busy timeout, full synchronous
/// commits and foreign keys.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    path: PathBuf,
    key: Option<String>,
    busy_timeout: Duration,
}

impl ConnectionFactory {
    pub fn new(path: impl Into<PathBuf>, passphrase: Option<&str>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            key: passphrase.map(derive_key),
            busy_timeout,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.database_path(),
            config.encryption_passphrase.as_deref(),
            config.busy_timeout(),
        )
    }

    /// Factory for another file sharing this factory's key and timeout
    pub fn for_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: self.key.clone(),
            busy_timeout: self.busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (creating if needed) a read-write connection
    pub fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        self.configure(&conn)?;
        Ok(conn)
    }

    /// Open an existing file read-write without creating it
    pub fn open_existing(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        self.configure(&conn)?;
        Ok(conn)
    }

    fn configure(&self, conn: &Connection) -> rusqlite::Result<()> {
        if let Some(ref key) = self.key {
            conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", key))?;
            // Plain SQLite ignores `PRAGMA key`; only SQLCipher reports a version
            let cipher: Option<String> = conn
                .query_row("PRAGMA cipher_version", [], |row| row.get(0))
                .optional()?;
            if cipher.is_none() {
                return Err(rusqlite::Error::InvalidParameterName(
                    "key: SQLCipher is not linked".to_string(),
                ));
            }
        }
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Create the schema and switch the file to write-ahead logging
    pub fn initialize(&self) -> rusqlite::Result<()> {
        let conn = self.open()?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

/// Raw SQLCipher key (hex) derived from a passphrase
pub fn derive_key(passphrase: &str) -> String {
    let digest = Sha256::digest(passphrase.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `-wal`, `-shm` and `-journal` paths belonging to a database file
pub fn side_files(database: &Path) -> Vec<PathBuf> {
    let name = database
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    SIDE_FILE_SUFFIXES
        .iter()
        .map(|suffix| database.with_file_name(format!("{}{}", name, suffix)))
        .collect()
}

/// Integrity problems reported by the engine; empty means the file is sound.
///
/// `full` runs `integrity_check` (every page and index), otherwise
/// `quick_check`.
pub fn integrity_problems(conn: &Connection, full: bool) -> rusqlite::Result<Vec<String>> {
    let sql = if full {
        "PRAGMA integrity_check"
    } else {
        "PRAGMA quick_check"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut problems = Vec::new();
    for row in rows {
        let line = row?;
        if line != "ok" {
            problems.push(line);
        }
    }
    Ok(problems)
}

/// Rebuild the file to reclaim free pages, then fold the WAL back in
pub fn vacuum(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("VACUUM;")?;
    checkpoint(conn)
}

/// Copy every WAL frame into the main file and truncate the WAL
pub fn checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
}

fn conversion_error<E>(column: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, ty, Box::new(err))
}

fn to_count(column: usize, raw: i64) -> rusqlite::Result<usize> {
    usize::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(column, raw))
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<BlockRecord> {
    let rank: i64 = row.get(2)?;
    let level = PersistenceLevel::from_rank(rank)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, rank))?;
    let format = match row.get::<_, Option<String>>(4)? {
        Some(json) => Some(
            serde_json::from_str::<BlockFormat>(&json)
                .map_err(|e| conversion_error(4, Type::Text, e))?,
        ),
        None => None,
    };
    Ok(BlockRecord {
        name: row.get(0)?,
        version: row.get(1)?,
        level,
        count: to_count(3, row.get(3)?)?,
        format,
    })
}

fn field_from_row(row: &Row<'_>) -> rusqlite::Result<FieldRecord> {
    let tag: i64 = row.get(2)?;
    let field_type =
        FieldType::from_tag(tag).ok_or(rusqlite::Error::IntegralValueOutOfRange(2, tag))?;
    Ok(FieldRecord {
        block_name: row.get(0)?,
        field_name: row.get(1)?,
        field_type,
        data: row.get(3)?,
        count: to_count(4, row.get(4)?)?,
    })
}

pub fn load_block(conn: &Connection, name: &str) -> rusqlite::Result<Option<BlockRecord>> {
    conn.query_row(
        "SELECT name, version, level, count, format FROM blocks WHERE name = ?1",
        params![name],
        block_from_row,
    )
    .optional()
}

pub fn list_blocks(conn: &Connection) -> rusqlite::Result<Vec<BlockRecord>> {
    let mut stmt =
        conn.prepare("SELECT name, version, level, count, format FROM blocks ORDER BY name")?;
    let rows = stmt.query_map([], block_from_row)?;
    rows.collect()
}

pub fn insert_block(conn: &Connection, record: &BlockRecord) -> rusqlite::Result<()> {
    let format = match record.format {
        Some(ref format) => Some(
            serde_json::to_string(format)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        ),
        None => None,
    };
    conn.execute(
        "INSERT INTO blocks (name, version, level, count, format) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.name,
            record.version,
            record.level.rank(),
            record.count as i64,
            format
        ],
    )?;
    Ok(())
}

pub fn set_block_count(conn: &Connection, name: &str, count: usize) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE blocks SET count = ?2 WHERE name = ?1",
        params![name, count as i64],
    )
}

pub fn set_block_level(
    conn: &Connection,
    name: &str,
    level: PersistenceLevel,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE blocks SET level = ?2 WHERE name = ?1",
        params![name, level.rank()],
    )
}

/// Declared or inferred type of every field stored for a block
pub fn field_types(conn: &Connection, block: &str) -> rusqlite::Result<Vec<(String, FieldType)>> {
    let mut stmt = conn.prepare(
        "SELECT field_name, data_type FROM block_fields WHERE block_name = ?1 ORDER BY field_name",
    )?;
    let rows = stmt.query_map(params![block], |row| {
        let tag: i64 = row.get(1)?;
        let field_type =
            FieldType::from_tag(tag).ok_or(rusqlite::Error::IntegralValueOutOfRange(1, tag))?;
        Ok((row.get::<_, String>(0)?, field_type))
    })?;
    rows.collect()
}

pub fn load_field(
    conn: &Connection,
    block: &str,
    field: &str,
) -> rusqlite::Result<Option<FieldRecord>> {
    conn.query_row(
        "SELECT block_name, field_name, data_type, data, count FROM block_fields
         WHERE block_name = ?1 AND field_name = ?2",
        params![block, field],
        field_from_row,
    )
    .optional()
}

pub fn load_fields(conn: &Connection, block: &str) -> rusqlite::Result<Vec<FieldRecord>> {
    let mut stmt = conn.prepare(
        "SELECT block_name, field_name, data_type, data, count FROM block_fields
         WHERE block_name = ?1 ORDER BY field_name",
    )?;
    let rows = stmt.query_map(params![block], field_from_row)?;
    rows.collect()
}

pub fn upsert_field(conn: &Connection, record: &FieldRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO block_fields (block_name, field_name, data_type, data, count)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (block_name, field_name) DO UPDATE SET
             data_type = excluded.data_type,
             data = excluded.data,
             count = excluded.count",
        params![
            record.block_name,
            record.field_name,
            record.field_type.tag(),
            record.data,
            record.count as i64
        ],
    )?;
    Ok(())
}

/// Delete every block cleared by a clear at `level`, fields first.
///
/// Returns the names of the deleted blocks.
pub fn delete_cleared_blocks(
    conn: &Connection,
    level: PersistenceLevel,
) -> rusqlite::Result<Vec<String>> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare("SELECT name FROM blocks WHERE level <= ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![level.rank()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    conn.execute(
        "DELETE FROM block_fields WHERE block_name IN (SELECT name FROM blocks WHERE level <= ?1)",
        params![level.rank()],
    )?;
    conn.execute("DELETE FROM blocks WHERE level <= ?1", params![level.rank()])?;
    Ok(names)
}
