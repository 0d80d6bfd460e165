// store/schema.rs
// Database schema and forward-only migrations

use anyhow::Result;
use rusqlite::Connection;

/// Base schema. One table per cached entity, all stamped with `cached_at`
/// (integer epoch seconds). Secondary indexes cover the TTL sweep column
/// and the searchable text columns.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    year        INTEGER NOT NULL,
    department  TEXT NOT NULL,
    cached_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_students_cached_at ON students(cached_at);
CREATE INDEX IF NOT EXISTS idx_students_name ON students(name);

CREATE TABLE IF NOT EXISTS contacts (
    uid          TEXT PRIMARY KEY,
    kind         TEXT NOT NULL CHECK (kind IN ('organization', 'individual')),
    name         TEXT NOT NULL,
    organization TEXT NOT NULL DEFAULT '',
    superior     TEXT NOT NULL DEFAULT '',
    title        TEXT NOT NULL DEFAULT '',
    phone        TEXT NOT NULL DEFAULT '',
    extension    TEXT NOT NULL DEFAULT '',
    email        TEXT NOT NULL DEFAULT '',
    location     TEXT NOT NULL DEFAULT '',
    website      TEXT NOT NULL DEFAULT '',
    cached_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contacts_cached_at ON contacts(cached_at);
CREATE INDEX IF NOT EXISTS idx_contacts_name ON contacts(name);

CREATE TABLE IF NOT EXISTS courses (
    uid        TEXT PRIMARY KEY,
    year       INTEGER NOT NULL,
    term       INTEGER NOT NULL,
    no         TEXT NOT NULL,
    title      TEXT NOT NULL,
    teachers   TEXT NOT NULL DEFAULT '[]',
    credits    TEXT NOT NULL DEFAULT '',
    time       TEXT NOT NULL DEFAULT '',
    location   TEXT NOT NULL DEFAULT '',
    eligible   TEXT NOT NULL DEFAULT '',
    cached_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_courses_cached_at ON courses(cached_at);
CREATE INDEX IF NOT EXISTS idx_courses_title ON courses(title);
CREATE INDEX IF NOT EXISTS idx_courses_semester ON courses(year, term);

CREATE TABLE IF NOT EXISTS syllabi (
    uid          TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    teachers     TEXT NOT NULL DEFAULT '[]',
    year         INTEGER NOT NULL,
    term         INTEGER NOT NULL,
    objectives   TEXT NOT NULL DEFAULT '',
    outline      TEXT NOT NULL DEFAULT '',
    schedule     TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL,
    cached_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_syllabi_cached_at ON syllabi(cached_at);
CREATE INDEX IF NOT EXISTS idx_syllabi_semester ON syllabi(year, term);

CREATE TABLE IF NOT EXISTS stickers (
    url       TEXT PRIMARY KEY,
    source    TEXT NOT NULL DEFAULT '',
    cached_at INTEGER NOT NULL,
    hits      INTEGER NOT NULL DEFAULT 0,
    failures  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_stickers_cached_at ON stickers(cached_at);

CREATE TABLE IF NOT EXISTS course_programs (
    course_uid TEXT NOT NULL REFERENCES courses(uid) ON DELETE CASCADE,
    program    TEXT NOT NULL,
    PRIMARY KEY (course_uid, program)
);
CREATE INDEX IF NOT EXISTS idx_course_programs_program ON course_programs(program);
";

/// Run all schema setup and migrations.
///
/// Called during pool initialization under the writer connection. Idempotent;
/// migrations only ever add, never rewrite.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    migrate_stickers_source_default(conn)?;
    Ok(())
}

/// Early deployments created stickers without the source tag.
fn migrate_stickers_source_default(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "stickers", "source")? {
        conn.execute("ALTER TABLE stickers ADD COLUMN source TEXT NOT NULL DEFAULT ''", [])?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let sql = format!("PRAGMA table_info({table})");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
