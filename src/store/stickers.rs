// store/stickers.rs
// Sticker cache with diagnostic counters

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::types::Sticker;
use super::GET_ALL_CAP;

const COLS: &str = "url, source, cached_at, hits, failures";

pub fn parse_sticker_row(row: &rusqlite::Row) -> rusqlite::Result<Sticker> {
    Ok(Sticker {
        url: row.get(0)?,
        source: row.get(1)?,
        cached_at: row.get(2)?,
        hits: row.get(3)?,
        failures: row.get(4)?,
    })
}

pub fn get_sticker_sync(conn: &Connection, url: &str) -> Result<Option<Sticker>> {
    let sticker = conn
        .query_row(
            &format!("SELECT {COLS} FROM stickers WHERE url = ?1"),
            [url],
            parse_sticker_row,
        )
        .optional()?;
    Ok(sticker)
}

/// Upsert, preserving the diagnostic counters of an existing row.
pub fn save_sticker_sync(conn: &Connection, sticker: &Sticker, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO stickers (url, source, cached_at, hits, failures) \
         VALUES (?1, ?2, ?3, 0, 0) \
         ON CONFLICT(url) DO UPDATE SET \
           source = excluded.source, \
           cached_at = MAX(cached_at, excluded.cached_at)",
        params![sticker.url, sticker.source, now],
    )?;
    Ok(())
}

/// Bump the success or failure counter. Diagnostics only.
pub fn record_sticker_outcome_sync(conn: &Connection, url: &str, ok: bool) -> Result<()> {
    let column = if ok { "hits" } else { "failures" };
    conn.execute(
        &format!("UPDATE stickers SET {column} = {column} + 1 WHERE url = ?1"),
        [url],
    )?;
    Ok(())
}

pub fn get_all_stickers_sync(conn: &Connection) -> Result<Vec<Sticker>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLS} FROM stickers ORDER BY url LIMIT {GET_ALL_CAP}"))?;
    let stickers = stmt
        .query_map([], parse_sticker_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(stickers)
}

/// A pseudo-random cached sticker, keyed on the caller-provided seed so the
/// choice is testable.
pub fn pick_sticker_sync(conn: &Connection, seed: u64) -> Result<Option<Sticker>> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM stickers", [], |row| row.get(0))?;
    if count == 0 {
        return Ok(None);
    }
    let offset = (seed % count as u64) as i64;
    let sticker = conn
        .query_row(
            &format!("SELECT {COLS} FROM stickers ORDER BY url LIMIT 1 OFFSET ?1"),
            [offset],
            parse_sticker_row,
        )
        .optional()?;
    Ok(sticker)
}

pub fn count_stickers_sync(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM stickers", [], |row| row.get(0))?;
    Ok(count)
}
