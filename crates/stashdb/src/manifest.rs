//! SQLite manifest: one row per item
//!
//! ```text
//! manifest(key TEXT PRIMARY KEY, filename TEXT, size INTEGER,
//!          inline_data BLOB, modification_time INTEGER,
//!          last_access_time INTEGER, extended_data BLOB)
//! ```

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::item::StorageItem;

/// Manifest file name under the storage root
pub(crate) const MANIFEST_FILE: &str = "manifest.sqlite";

/// SQLite parameter limit is 999 on older builds
const MAX_VARS: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS manifest (
    key               TEXT PRIMARY KEY NOT NULL,
    filename          TEXT,
    size              INTEGER NOT NULL DEFAULT 0,
    inline_data       BLOB,
    modification_time INTEGER NOT NULL,
    last_access_time  INTEGER NOT NULL,
    extended_data     BLOB
);
CREATE INDEX IF NOT EXISTS manifest_access_idx ON manifest(last_access_time);
CREATE INDEX IF NOT EXISTS manifest_mod_idx ON manifest(modification_time);
";

const INFO_COLUMNS: &str =
    "key, filename, size, modification_time, last_access_time, extended_data";

/// Metadata needed to evict an item without loading its value
#[derive(Debug, Clone)]
pub(crate) struct Victim {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

pub(crate) fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub(crate) fn upsert(
    conn: &Connection,
    item: &StorageItem,
    inline_value: Option<&[u8]>,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO manifest
            (key, filename, size, inline_data, modification_time, last_access_time, extended_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    stmt.execute(params![
        item.key,
        item.filename,
        item.size as i64,
        inline_value,
        item.mod_time,
        item.access_time,
        item.extended_data,
    ])?;
    Ok(())
}

pub(crate) fn touch(conn: &Connection, key: &str, time: i64) -> rusqlite::Result<()> {
    let mut stmt =
        conn.prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")?;
    stmt.execute(params![time, key])?;
    Ok(())
}

fn info_from_row(row: &Row<'_>) -> rusqlite::Result<StorageItem> {
    Ok(StorageItem {
        key: row.get(0)?,
        value: Vec::new(),
        filename: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mod_time: row.get(3)?,
        access_time: row.get(4)?,
        extended_data: row.get(5)?,
    })
}

/// Full row including inline bytes (empty for file-backed items)
pub(crate) fn select_item(conn: &Connection, key: &str) -> rusqlite::Result<Option<StorageItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {}, inline_data FROM manifest WHERE key = ?1",
        INFO_COLUMNS
    ))?;
    stmt.query_row(params![key], |row| {
        let mut item = info_from_row(row)?;
        item.value = row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default();
        Ok(item)
    })
    .optional()
}

pub(crate) fn select_info(conn: &Connection, key: &str) -> rusqlite::Result<Option<StorageItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM manifest WHERE key = ?1",
        INFO_COLUMNS
    ))?;
    stmt.query_row(params![key], info_from_row).optional()
}

pub(crate) fn select_infos(conn: &Connection, keys: &[&str]) -> rusqlite::Result<Vec<StorageItem>> {
    let mut items = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(MAX_VARS) {
        let sql = format!(
            "SELECT {} FROM manifest WHERE key IN ({})",
            INFO_COLUMNS,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), info_from_row)?;
        for row in rows {
            items.push(row?);
        }
    }
    Ok(items)
}

/// `None` when the row is missing, `Some(None)` when the row is inline
pub(crate) fn select_filename(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<Option<String>>> {
    let mut stmt = conn.prepare_cached("SELECT filename FROM manifest WHERE key = ?1")?;
    stmt.query_row(params![key], |row| row.get(0)).optional()
}

pub(crate) fn select_victims_for_keys(
    conn: &Connection,
    keys: &[&str],
) -> rusqlite::Result<Vec<Victim>> {
    let mut victims = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(MAX_VARS) {
        let sql = format!(
            "SELECT key, filename, size FROM manifest WHERE key IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), victim_from_row)?;
        for row in rows {
            victims.push(row?);
        }
    }
    Ok(victims)
}

fn victim_from_row(row: &Row<'_>) -> rusqlite::Result<Victim> {
    Ok(Victim {
        key: row.get(0)?,
        filename: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
    })
}

pub(crate) fn select_larger_than(conn: &Connection, size: u64) -> rusqlite::Result<Vec<Victim>> {
    let mut stmt = conn.prepare_cached("SELECT key, filename, size FROM manifest WHERE size > ?1")?;
    let rows = stmt.query_map(params![size.min(i64::MAX as u64) as i64], victim_from_row)?;
    rows.collect()
}

pub(crate) fn select_modified_before(
    conn: &Connection,
    time: i64,
) -> rusqlite::Result<Vec<Victim>> {
    let mut stmt = conn.prepare_cached(
        "SELECT key, filename, size FROM manifest WHERE modification_time < ?1",
    )?;
    let rows = stmt.query_map(params![time], victim_from_row)?;
    rows.collect()
}

/// Least recently used items first, ties by older write, then insertion order
pub(crate) fn select_lru(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<Victim>> {
    let mut stmt = conn.prepare_cached(
        "SELECT key, filename, size FROM manifest
         ORDER BY last_access_time ASC, modification_time ASC, rowid ASC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], victim_from_row)?;
    rows.collect()
}

/// `(key, filename)` for every file-backed row
pub(crate) fn select_file_refs(conn: &Connection) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt =
        conn.prepare_cached("SELECT key, filename FROM manifest WHERE filename IS NOT NULL")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub(crate) fn delete(conn: &Connection, key: &str) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE key = ?1")?;
    stmt.execute(params![key])
}

pub(crate) fn delete_all(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM manifest", [])
}

pub(crate) fn count(conn: &Connection) -> rusqlite::Result<u64> {
    let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM manifest")?;
    let count: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(count as u64)
}

pub(crate) fn total_size(conn: &Connection) -> rusqlite::Result<u64> {
    let mut stmt = conn.prepare_cached("SELECT COALESCE(SUM(size), 0) FROM manifest")?;
    let size: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(size as u64)
}

fn placeholders(n: usize) -> String {
    let mut sql = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    fn item(key: &str, size: u64, access: i64, modified: i64) -> StorageItem {
        StorageItem {
            key: key.to_string(),
            size,
            mod_time: modified,
            access_time: access,
            ..Default::default()
        }
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    #[test]
    fn test_upsert_replaces_row() {
        let conn = memory();
        upsert(&conn, &item("a", 3, 1, 1), Some(b"abc")).unwrap();
        upsert(&conn, &item("a", 2, 5, 5), Some(b"xy")).unwrap();

        assert_eq!(count(&conn).unwrap(), 1);
        let stored = select_item(&conn, "a").unwrap().unwrap();
        assert_eq!(stored.value, b"xy");
        assert_eq!(stored.mod_time, 5);
        assert_eq!(total_size(&conn).unwrap(), 2);
    }

    #[test]
    fn test_lru_order_breaks_ties_by_mod_time() {
        let conn = memory();
        upsert(&conn, &item("newer-write", 1, 10, 9), None).unwrap();
        upsert(&conn, &item("older-write", 1, 10, 3), None).unwrap();
        upsert(&conn, &item("recent", 1, 50, 1), None).unwrap();
        upsert(&conn, &item("stale", 1, 2, 2), None).unwrap();

        let keys: Vec<_> = select_lru(&conn, 10)
            .unwrap()
            .into_iter()
            .map(|v| v.key)
            .collect();
        assert_eq!(keys, vec!["stale", "older-write", "newer-write", "recent"]);
    }

    #[test]
    fn test_select_infos_skips_missing() {
        let conn = memory();
        upsert(&conn, &item("a", 1, 1, 1), None).unwrap();
        upsert(&conn, &item("b", 1, 1, 1), None).unwrap();

        let infos = select_infos(&conn, &["a", "zzz", "b"]).unwrap();
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn test_empty_aggregates() {
        let conn = memory();
        assert_eq!(count(&conn).unwrap(), 0);
        assert_eq!(total_size(&conn).unwrap(), 0);
        assert_eq!(select_filename(&conn, "a").unwrap(), None);
    }
}
