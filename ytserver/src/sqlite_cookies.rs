//! Firefox `cookies.sqlite` support.
//!
//! Reading the database and rendering Netscape text are kept apart:
//! [`read_cookie_rows`] only knows SQLite, [`to_netscape`] only knows the
//! decoded rows.

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tempfile::TempDir;
use tracing::debug;

pub const SQLITE_MAGIC: &[u8] = b"SQLite format 3";
pub const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";
pub const CONVERTED_HEADER: &str = "# Converted from Firefox cookies.sqlite";
pub const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

const COOKIE_TABLE: &str = "moz_cookies";

/// One decoded `moz_cookies` row. Absent or NULL cells are already folded
/// into empty strings and zeroes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieRow {
    pub host: String,
    pub path: String,
    pub is_secure: bool,
    pub expiry: i64,
    pub name: String,
    pub value: String,
    pub is_http_only: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite cookies file is not in the expected Firefox format")]
    MissingTable,
    #[error("unable to read cookies.sqlite file: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unable to stage cookies.sqlite file: {0}")]
    Io(#[from] std::io::Error),
}

pub fn is_sqlite(content: &[u8]) -> bool {
    content.starts_with(SQLITE_MAGIC)
}

/// Copies `content` to a scratch database and reads every cookie row from it.
/// SQLite needs a real file, so the bytes never get parsed in memory.
pub fn read_rows_from_bytes(content: &[u8]) -> Result<Vec<CookieRow>, StoreError> {
    read_rows_from_bytes_in(&std::env::temp_dir(), content)
}

/// Like [`read_rows_from_bytes`], staging under `scratch_root`.
///
/// The database lives in its own directory: a WAL-mode store makes SQLite
/// create `-wal` and `-shm` files next to it, and those go away together
/// with the directory.
pub fn read_rows_from_bytes_in(
    scratch_root: &Path,
    content: &[u8],
) -> Result<Vec<CookieRow>, StoreError> {
    let scratch = TempDir::with_prefix_in("cookies-", scratch_root)?;
    let db_path = scratch.path().join("cookies.sqlite");
    std::fs::write(&db_path, content)?;
    let rows = read_cookie_rows(&db_path);
    drop(scratch);
    rows
}

pub fn read_cookie_rows(path: &Path) -> Result<Vec<CookieRow>, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [COOKIE_TABLE],
        |row| row.get(0),
    )?;
    if !has_table {
        return Err(StoreError::MissingTable);
    }

    let mut stmt = conn.prepare(
        "SELECT host, path, isSecure, expiry, name, value, COALESCE(isHttpOnly, 0)
         FROM moz_cookies",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CookieRow {
                host: text_cell(row.get_ref(0)?),
                path: text_cell(row.get_ref(1)?),
                is_secure: int_cell(row.get_ref(2)?) != 0,
                expiry: int_cell(row.get_ref(3)?),
                name: text_cell(row.get_ref(4)?),
                value: text_cell(row.get_ref(5)?),
                is_http_only: int_cell(row.get_ref(6)?) != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Renders rows as a Netscape cookie jar: two header comments, one
/// tab-separated line per row, trailing newline.
pub fn to_netscape(rows: &[CookieRow]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(NETSCAPE_HEADER.to_string());
    lines.push(CONVERTED_HEADER.to_string());
    lines.extend(rows.iter().map(netscape_line));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn netscape_line(row: &CookieRow) -> String {
    let domain = if row.is_http_only {
        format!("{HTTP_ONLY_PREFIX}{}", row.host)
    } else {
        row.host.clone()
    };
    let include_subdomains = flag(row.host.starts_with('.'));
    let path = if row.path.is_empty() { "/" } else { row.path.as_str() };

    [
        domain.as_str(),
        include_subdomains,
        path,
        flag(row.is_secure),
        &row.expiry.to_string(),
        &row.name,
        &row.value,
    ]
    .join("\t")
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

fn text_cell(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn int_cell(value: ValueRef<'_>) -> i64 {
    match value {
        ValueRef::Integer(i) => i,
        ValueRef::Real(f) => f as i64,
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|f| f as i64)
            .unwrap_or(0),
        ValueRef::Null | ValueRef::Blob(_) => 0,
    }
}
