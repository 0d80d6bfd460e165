// store/students.rs
// Student cache operations

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::fuzzy::rune_set_match;
use super::types::Student;
use super::{GET_ALL_CAP, LIKE_CAP, like_pattern};

/// Parse a Student from a row with column order
/// (id, name, year, department, cached_at).
pub fn parse_student_row(row: &rusqlite::Row) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        year: row.get(2)?,
        department: row.get(3)?,
        cached_at: row.get(4)?,
    })
}

const COLS: &str = "id, name, year, department, cached_at";

pub fn get_student_sync(conn: &Connection, id: &str) -> Result<Option<Student>> {
    let student = conn
        .query_row(
            &format!("SELECT {COLS} FROM students WHERE id = ?1"),
            [id],
            parse_student_row,
        )
        .optional()?;
    Ok(student)
}

/// Upsert, stamping `cached_at` so a refresh never moves the record
/// backwards in time.
pub fn save_student_sync(conn: &Connection, student: &Student, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO students (id, name, year, department, cached_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET \
           name = excluded.name, \
           year = excluded.year, \
           department = excluded.department, \
           cached_at = MAX(cached_at, excluded.cached_at)",
        params![student.id, student.name, student.year, student.department, now],
    )?;
    Ok(())
}

/// Two-tier name search: SQL substring union fuzzy rune-set, deduplicated
/// on the student number preserving first-seen order.
pub fn search_students_by_name_sync(conn: &Connection, query: &str) -> Result<Vec<Student>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM students WHERE name LIKE ?1 ESCAPE '\\' LIMIT {LIKE_CAP}"
    ))?;
    let like_hits: Vec<Student> = stmt
        .query_map([like_pattern(query)], parse_student_row)?
        .collect::<rusqlite::Result<_>>()?;

    let all = get_all_students_sync(conn)?;
    let fuzzy_hits = all.into_iter().filter(|s| rune_set_match(query, &s.name));

    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for s in like_hits.into_iter().chain(fuzzy_hits) {
        if seen.insert(s.id.clone()) {
            results.push(s);
        }
    }
    Ok(results)
}

/// Every cached student, bounded by the hard cap. Used only by the fuzzy
/// search tier.
pub fn get_all_students_sync(conn: &Connection) -> Result<Vec<Student>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLS} FROM students ORDER BY id LIMIT {GET_ALL_CAP}"))?;
    let students = stmt
        .query_map([], parse_student_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(students)
}

/// Students of one department and entry year. Used by warmup to detect
/// units already covered.
pub fn count_students_by_unit_sync(conn: &Connection, department: &str, year: i32) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE department = ?1 AND year = ?2",
        params![department, year],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_students_sync(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
    Ok(count)
}
