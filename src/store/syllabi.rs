// store/syllabi.rs
// Syllabus cache operations
//
// Syllabi feed the lexical index. The builder streams one semester at a
// time via `get_syllabi_by_semester_sync`, bounding peak memory by the
// largest single semester rather than the whole corpus.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::types::{Semester, Syllabus};
use super::GET_ALL_CAP;

const COLS: &str =
    "uid, title, teachers, year, term, objectives, outline, schedule, content_hash, cached_at";

pub fn parse_syllabus_row(row: &rusqlite::Row) -> rusqlite::Result<Syllabus> {
    let teachers_json: String = row.get(2)?;
    Ok(Syllabus {
        uid: row.get(0)?,
        title: row.get(1)?,
        teachers: serde_json::from_str(&teachers_json).unwrap_or_default(),
        year: row.get(3)?,
        term: row.get(4)?,
        objectives: row.get(5)?,
        outline: row.get(6)?,
        schedule: row.get(7)?,
        content_hash: row.get(8)?,
        cached_at: row.get(9)?,
    })
}

pub fn get_syllabus_sync(conn: &Connection, uid: &str) -> Result<Option<Syllabus>> {
    let syllabus = conn
        .query_row(
            &format!("SELECT {COLS} FROM syllabi WHERE uid = ?1"),
            [uid],
            parse_syllabus_row,
        )
        .optional()?;
    Ok(syllabus)
}

/// Upsert. Returns true when the content hash changed (or the row is new),
/// which is what gates index rebuilds after a refresh cycle.
pub fn save_syllabus_sync(conn: &Connection, syllabus: &Syllabus, now: i64) -> Result<bool> {
    let prior_hash: Option<String> = conn
        .query_row(
            "SELECT content_hash FROM syllabi WHERE uid = ?1",
            [&syllabus.uid],
            |row| row.get(0),
        )
        .optional()?;
    let changed = prior_hash.as_deref() != Some(syllabus.content_hash.as_str());

    let teachers_json = serde_json::to_string(&syllabus.teachers)?;
    conn.execute(
        "INSERT INTO syllabi \
         (uid, title, teachers, year, term, objectives, outline, schedule, content_hash, cached_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(uid) DO UPDATE SET \
           title = excluded.title, \
           teachers = excluded.teachers, \
           year = excluded.year, \
           term = excluded.term, \
           objectives = excluded.objectives, \
           outline = excluded.outline, \
           schedule = excluded.schedule, \
           content_hash = excluded.content_hash, \
           cached_at = MAX(cached_at, excluded.cached_at)",
        params![
            syllabus.uid,
            syllabus.title,
            teachers_json,
            syllabus.year,
            syllabus.term,
            syllabus.objectives,
            syllabus.outline,
            syllabus.schedule,
            syllabus.content_hash,
            now
        ],
    )?;
    Ok(changed)
}

/// Distinct semesters in the syllabus table, newest first. Drives the
/// semester-chunked index build.
pub fn distinct_semesters_sync(conn: &Connection) -> Result<Vec<Semester>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT year, term FROM syllabi ORDER BY year DESC, term DESC")?;
    let semesters = stmt
        .query_map([], |row| Ok(Semester::new(row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(semesters)
}

/// One semester's syllabi.
pub fn get_syllabi_by_semester_sync(conn: &Connection, semester: Semester) -> Result<Vec<Syllabus>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM syllabi WHERE year = ?1 AND term = ?2 ORDER BY uid LIMIT {GET_ALL_CAP}"
    ))?;
    let syllabi = stmt
        .query_map(params![semester.year, semester.term], parse_syllabus_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(syllabi)
}

pub fn count_syllabi_sync(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM syllabi", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample(uid: &str, year: i32, term: u8, title: &str) -> Syllabus {
        Syllabus {
            uid: uid.into(),
            title: title.into(),
            teachers: vec!["張老師".into()],
            year,
            term,
            objectives: "了解雲端運算與 AWS 服務".into(),
            outline: "IaaS PaaS SaaS".into(),
            schedule: "week 1-18".into(),
            content_hash: Syllabus::compute_hash(title, "了解雲端運算與 AWS 服務", "IaaS PaaS SaaS", "week 1-18"),
            cached_at: 0,
        }
    }

    #[test]
    fn test_round_trip() {
        let conn = test_conn();
        let s = sample("1131U0690", 113, 1, "雲端運算");
        save_syllabus_sync(&conn, &s, 10).unwrap();

        let got = get_syllabus_sync(&conn, "1131U0690").unwrap().unwrap();
        assert_eq!(got.title, "雲端運算");
        assert_eq!(got.content_hash, s.content_hash);
        assert_eq!(got.cached_at, 10);
    }

    #[test]
    fn test_save_reports_hash_change() {
        let conn = test_conn();
        let mut s = sample("1131U0690", 113, 1, "雲端運算");

        // New row counts as changed
        assert!(save_syllabus_sync(&conn, &s, 1).unwrap());
        // Identical content does not
        assert!(!save_syllabus_sync(&conn, &s, 2).unwrap());

        s.outline = "容器與無伺服器".into();
        s.content_hash =
            Syllabus::compute_hash(&s.title, &s.objectives, &s.outline, &s.schedule);
        assert!(save_syllabus_sync(&conn, &s, 3).unwrap());
    }

    #[test]
    fn test_semester_chunked_fetch() {
        let conn = test_conn();
        save_syllabus_sync(&conn, &sample("1131U0690", 113, 1, "雲端運算"), 1).unwrap();
        save_syllabus_sync(&conn, &sample("1131U0700", 113, 1, "資料結構"), 1).unwrap();
        save_syllabus_sync(&conn, &sample("1122U0100", 112, 2, "作業系統"), 1).unwrap();

        let semesters = distinct_semesters_sync(&conn).unwrap();
        assert_eq!(semesters, vec![Semester::new(113, 1), Semester::new(112, 2)]);

        let chunk = get_syllabi_by_semester_sync(&conn, Semester::new(113, 1)).unwrap();
        assert_eq!(chunk.len(), 2);
        assert_eq!(count_syllabi_sync(&conn).unwrap(), 3);
    }
}
