// store/courses.rs
// Course cache operations and the derived course↔program relation

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::fuzzy::rune_set_match;
use super::types::{Course, Semester};
use super::{GET_ALL_CAP, LIKE_CAP, like_pattern};

const COLS: &str =
    "uid, year, term, no, title, teachers, credits, time, location, eligible, cached_at";

/// Parse a Course from a row in COLS order. The teachers column is a JSON
/// array; a malformed value yields an empty list rather than a torn record.
pub fn parse_course_row(row: &rusqlite::Row) -> rusqlite::Result<Course> {
    let teachers_json: String = row.get(5)?;
    Ok(Course {
        uid: row.get(0)?,
        year: row.get(1)?,
        term: row.get(2)?,
        no: row.get(3)?,
        title: row.get(4)?,
        teachers: serde_json::from_str(&teachers_json).unwrap_or_default(),
        credits: row.get(6)?,
        time: row.get(7)?,
        location: row.get(8)?,
        eligible: row.get(9)?,
        cached_at: row.get(10)?,
    })
}

pub fn get_course_sync(conn: &Connection, uid: &str) -> Result<Option<Course>> {
    let course = conn
        .query_row(
            &format!("SELECT {COLS} FROM courses WHERE uid = ?1"),
            [uid],
            parse_course_row,
        )
        .optional()?;
    Ok(course)
}

/// Upsert a course and resynthesize its program relation from the
/// eligible-class field.
pub fn save_course_sync(conn: &Connection, course: &Course, now: i64) -> Result<()> {
    let teachers_json = serde_json::to_string(&course.teachers)?;
    conn.execute(
        "INSERT INTO courses \
         (uid, year, term, no, title, teachers, credits, time, location, eligible, cached_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT(uid) DO UPDATE SET \
           year = excluded.year, \
           term = excluded.term, \
           no = excluded.no, \
           title = excluded.title, \
           teachers = excluded.teachers, \
           credits = excluded.credits, \
           time = excluded.time, \
           location = excluded.location, \
           eligible = excluded.eligible, \
           cached_at = MAX(cached_at, excluded.cached_at)",
        params![
            course.uid,
            course.year,
            course.term,
            course.no,
            course.title,
            teachers_json,
            course.credits,
            course.time,
            course.location,
            course.eligible,
            now
        ],
    )?;

    conn.execute("DELETE FROM course_programs WHERE course_uid = ?1", [&course.uid])?;
    for program in programs_from_eligible(&course.eligible) {
        conn.execute(
            "INSERT OR IGNORE INTO course_programs (course_uid, program) VALUES (?1, ?2)",
            params![course.uid, program],
        )?;
    }
    Ok(())
}

/// Split the eligible-class field into program strings. The upstream field
/// mixes full-width and half-width separators.
pub fn programs_from_eligible(eligible: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    eligible
        .split(['、', ',', ';', '；', ' ', '\u{3000}'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

/// Two-tier title search, unioned and deduplicated on uid.
pub fn search_courses_by_title_sync(conn: &Connection, query: &str) -> Result<Vec<Course>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM courses WHERE title LIKE ?1 ESCAPE '\\' \
         ORDER BY year DESC, term DESC LIMIT {LIKE_CAP}"
    ))?;
    let like_hits: Vec<Course> = stmt
        .query_map([like_pattern(query)], parse_course_row)?
        .collect::<rusqlite::Result<_>>()?;

    let all = get_all_courses_sync(conn)?;
    let fuzzy_hits = all.into_iter().filter(|c| rune_set_match(query, &c.title));

    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for c in like_hits.into_iter().chain(fuzzy_hits) {
        if seen.insert(c.uid.clone()) {
            results.push(c);
        }
    }
    Ok(results)
}

pub fn get_all_courses_sync(conn: &Connection) -> Result<Vec<Course>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM courses ORDER BY year DESC, term DESC, no LIMIT {GET_ALL_CAP}"
    ))?;
    let courses = stmt
        .query_map([], parse_course_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(courses)
}

/// Programs attached to a course, alphabetical.
pub fn get_course_programs_sync(conn: &Connection, uid: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT program FROM course_programs WHERE course_uid = ?1 ORDER BY program")?;
    let programs = stmt
        .query_map([uid], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(programs)
}

/// Courses carrying a program tag, newest semester first.
pub fn get_courses_by_program_sync(conn: &Connection, program: &str) -> Result<Vec<Course>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM courses c \
         JOIN course_programs cp ON cp.course_uid = c.uid \
         WHERE cp.program = ?1 \
         ORDER BY c.year DESC, c.term DESC, c.no LIMIT {LIKE_CAP}"
    ))?;
    let courses = stmt
        .query_map([program], parse_course_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(courses)
}

/// Distinct semesters present in the course table, newest first.
pub fn distinct_course_semesters_sync(conn: &Connection) -> Result<Vec<Semester>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT year, term FROM courses ORDER BY year DESC, term DESC")?;
    let semesters = stmt
        .query_map([], |row| Ok(Semester::new(row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(semesters)
}

pub fn count_courses_sync(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM courses", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::run_migrations;
    use crate::store::types::course_uid;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample(year: i32, term: u8, no: &str, title: &str) -> Course {
        Course {
            uid: course_uid(year, term, no),
            year,
            term,
            no: no.into(),
            title: title.into(),
            teachers: vec!["張老師".into()],
            credits: "3".into(),
            time: "二34".into(),
            location: "資訊大樓".into(),
            eligible: "資工三、資工四".into(),
            cached_at: 0,
        }
    }

    #[test]
    fn test_round_trip_with_teachers() {
        let conn = test_conn();
        let c = sample(113, 1, "U0690", "雲端運算");
        save_course_sync(&conn, &c, 100).unwrap();

        let got = get_course_sync(&conn, &c.uid).unwrap().unwrap();
        assert_eq!(got.title, "雲端運算");
        assert_eq!(got.teachers, vec!["張老師".to_string()]);
        assert_eq!(got.cached_at, 100);
    }

    #[test]
    fn test_program_relation_synthesized() {
        let conn = test_conn();
        let c = sample(113, 1, "U0690", "雲端運算");
        save_course_sync(&conn, &c, 1).unwrap();

        let programs = get_course_programs_sync(&conn, &c.uid).unwrap();
        assert_eq!(programs, vec!["資工三".to_string(), "資工四".to_string()]);

        let courses = get_courses_by_program_sync(&conn, "資工三").unwrap();
        assert_eq!(courses.len(), 1);
    }

    #[test]
    fn test_program_relation_resync_on_update() {
        let conn = test_conn();
        let mut c = sample(113, 1, "U0690", "雲端運算");
        save_course_sync(&conn, &c, 1).unwrap();

        c.eligible = "資工三".into();
        save_course_sync(&conn, &c, 2).unwrap();
        let programs = get_course_programs_sync(&conn, &c.uid).unwrap();
        assert_eq!(programs, vec!["資工三".to_string()]);
    }

    #[test]
    fn test_programs_from_eligible_separators() {
        assert_eq!(
            programs_from_eligible("資工三、資工四,電機二"),
            vec!["資工三", "資工四", "電機二"]
        );
        assert!(programs_from_eligible("  ").is_empty());
        // duplicates collapse
        assert_eq!(programs_from_eligible("資工三、資工三").len(), 1);
    }

    #[test]
    fn test_search_title_tiers() {
        let conn = test_conn();
        save_course_sync(&conn, &sample(113, 1, "U0690", "雲端運算"), 1).unwrap();
        save_course_sync(&conn, &sample(113, 1, "U0700", "資料結構"), 1).unwrap();

        assert_eq!(search_courses_by_title_sync(&conn, "雲端").unwrap().len(), 1);
        // fuzzy: non-contiguous runes
        assert_eq!(search_courses_by_title_sync(&conn, "雲算").unwrap().len(), 1);
        assert_eq!(search_courses_by_title_sync(&conn, "量子").unwrap().len(), 0);
    }

    #[test]
    fn test_distinct_semesters_newest_first() {
        let conn = test_conn();
        save_course_sync(&conn, &sample(112, 2, "U0001", "a"), 1).unwrap();
        save_course_sync(&conn, &sample(113, 1, "U0002", "b"), 1).unwrap();
        save_course_sync(&conn, &sample(113, 1, "U0003", "c"), 1).unwrap();

        let semesters = distinct_course_semesters_sync(&conn).unwrap();
        assert_eq!(semesters, vec![Semester::new(113, 1), Semester::new(112, 2)]);
    }
}
