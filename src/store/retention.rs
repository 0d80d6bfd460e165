// store/retention.rs
// TTL sweep and integrity self-test

use rusqlite::Connection;
use std::time::Duration;

/// Batch size for deletes. Keeps the writer lock short for large backlogs.
const DELETE_BATCH: usize = 10_000;

/// Entity tables swept by TTL, children before parents so foreign keys
/// never block a delete.
const SWEPT_TABLES: [&str; 5] = ["syllabi", "courses", "students", "contacts", "stickers"];

/// Delete rows whose `cached_at` is older than the TTL bound. Returns the
/// number of rows deleted. Running the sweep twice in a row deletes nothing
/// the second time.
pub fn cleanup_expired_sync(
    conn: &Connection,
    ttl: Duration,
    now: i64,
) -> Result<usize, rusqlite::Error> {
    let cutoff = now - ttl.as_secs() as i64;
    let mut total_deleted = 0;

    for table in SWEPT_TABLES {
        // Batched deletes via rowid subquery; works without
        // SQLITE_ENABLE_UPDATE_DELETE_LIMIT.
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN \
             (SELECT rowid FROM {table} WHERE cached_at < ?1 LIMIT {DELETE_BATCH})"
        );
        loop {
            let count = conn.execute(&sql, [cutoff])?;
            if count == 0 {
                break;
            }
            total_deleted += count;
            tracing::info!(table, deleted = count, "TTL sweep removed expired rows");
            if count < DELETE_BATCH {
                break;
            }
        }
    }

    // Orphaned program edges cascade with their course, but a manual sweep
    // of the junction table covers databases created before the FK was
    // enforced.
    let orphans = conn.execute(
        "DELETE FROM course_programs WHERE course_uid NOT IN (SELECT uid FROM courses)",
        [],
    )?;
    if orphans > 0 {
        tracing::info!(deleted = orphans, "removed orphaned program edges");
        total_deleted += orphans;
    }

    Ok(total_deleted)
}

/// Report-only integrity self-test. A failure is logged and counted by the
/// caller; it never kills the process.
pub fn integrity_check_sync(conn: &Connection) -> Result<(), String> {
    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if verdict == "ok" {
        Ok(())
    } else {
        Err(verdict)
    }
}

/// Rows whose `cached_at` would fall to the next sweep. For logs and the
/// degraded-store metric.
pub fn count_expired_sync(
    conn: &Connection,
    ttl: Duration,
    now: i64,
) -> Result<usize, rusqlite::Error> {
    let cutoff = now - ttl.as_secs() as i64;
    let mut total = 0usize;
    for table in SWEPT_TABLES {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE cached_at < ?1"),
            [cutoff],
            |row| row.get(0),
        )?;
        total += count as usize;
    }
    Ok(total)
}
