// store/mod.rs
// Durable local content store: TTL'd cache over an embedded SQLite database

mod contacts;
mod courses;
pub mod fuzzy;
pub mod pool;
pub mod retention;
mod schema;
mod stickers;
mod students;
mod syllabi;
pub mod types;

pub use contacts::{
    count_contacts_sync, get_all_contacts_sync, get_contact_sync, parse_contact_row,
    save_contact_sync, search_contacts_by_name_sync,
};
pub use courses::{
    count_courses_sync, distinct_course_semesters_sync, get_all_courses_sync,
    get_course_programs_sync, get_course_sync, get_courses_by_program_sync, parse_course_row,
    programs_from_eligible, save_course_sync, search_courses_by_title_sync,
};
pub use stickers::{
    count_stickers_sync, get_all_stickers_sync, get_sticker_sync, pick_sticker_sync,
    record_sticker_outcome_sync, save_sticker_sync,
};
pub use students::{
    count_students_by_unit_sync, count_students_sync, get_all_students_sync, get_student_sync,
    parse_student_row, save_student_sync, search_students_by_name_sync,
};
pub use syllabi::{
    count_syllabi_sync, distinct_semesters_sync, get_syllabi_by_semester_sync, get_syllabus_sync,
    parse_syllabus_row, save_syllabus_sync,
};

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use crate::store::pool::StorePool;
use crate::store::types::{Contact, Course, Semester, Sticker, Student, Syllabus};

/// Bound for LIKE-tier search results.
pub(crate) const LIKE_CAP: usize = 500;

/// Hard cap for full-table reads (index builders and the fuzzy tier only).
pub(crate) const GET_ALL_CAP: usize = 10_000;

/// Escape LIKE metacharacters and wrap in wildcards.
pub(crate) fn like_pattern(query: &str) -> String {
    let escaped = query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{escaped}%")
}

/// Epoch seconds now.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The single writer of every cached entity. All writes stamp `cached_at`;
/// reads return a populated record or not-found, never a torn row.
pub struct Store {
    pool: StorePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: StorePool::open(path).await?,
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self {
            pool: StorePool::open_in_memory().await?,
        })
    }

    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    /// Ping both the reader and writer connections.
    pub async fn ready(&self) -> Result<()> {
        self.pool.ready().await
    }

    // ── Students ──

    pub async fn get_student(&self, id: &str) -> Result<Option<Student>> {
        let id = id.to_string();
        self.pool.read(move |conn| get_student_sync(conn, &id)).await
    }

    pub async fn save_student(&self, student: Student) -> Result<()> {
        let now = now_epoch();
        self.pool
            .write(move |conn| save_student_sync(conn, &student, now))
            .await
    }

    pub async fn search_students_by_name(&self, query: &str) -> Result<Vec<Student>> {
        let query = query.to_string();
        self.pool
            .read(move |conn| search_students_by_name_sync(conn, &query))
            .await
    }

    /// Every cached student, bounded by the hard cap. Index builders and
    /// the fuzzy fallback only.
    pub async fn get_all_students(&self) -> Result<Vec<Student>> {
        self.pool.read(get_all_students_sync).await
    }

    pub async fn count_students(&self) -> Result<i64> {
        self.pool.read(count_students_sync).await
    }

    // ── Contacts ──

    pub async fn get_contact(&self, uid: &str) -> Result<Option<Contact>> {
        let uid = uid.to_string();
        self.pool.read(move |conn| get_contact_sync(conn, &uid)).await
    }

    pub async fn save_contact(&self, contact: Contact) -> Result<()> {
        let now = now_epoch();
        self.pool
            .write(move |conn| save_contact_sync(conn, &contact, now))
            .await
    }

    pub async fn search_contacts_by_name(&self, query: &str) -> Result<Vec<Contact>> {
        let query = query.to_string();
        self.pool
            .read(move |conn| search_contacts_by_name_sync(conn, &query))
            .await
    }

    pub async fn get_all_contacts(&self) -> Result<Vec<Contact>> {
        self.pool.read(get_all_contacts_sync).await
    }

    pub async fn count_contacts(&self) -> Result<i64> {
        self.pool.read(count_contacts_sync).await
    }

    // ── Courses ──

    pub async fn get_course(&self, uid: &str) -> Result<Option<Course>> {
        let uid = uid.to_string();
        self.pool.read(move |conn| get_course_sync(conn, &uid)).await
    }

    pub async fn save_course(&self, course: Course) -> Result<()> {
        let now = now_epoch();
        self.pool
            .write(move |conn| save_course_sync(conn, &course, now))
            .await
    }

    pub async fn search_courses_by_title(&self, query: &str) -> Result<Vec<Course>> {
        let query = query.to_string();
        self.pool
            .read(move |conn| search_courses_by_title_sync(conn, &query))
            .await
    }

    pub async fn get_courses_by_program(&self, program: &str) -> Result<Vec<Course>> {
        let program = program.to_string();
        self.pool
            .read(move |conn| get_courses_by_program_sync(conn, &program))
            .await
    }

    pub async fn get_course_programs(&self, uid: &str) -> Result<Vec<String>> {
        let uid = uid.to_string();
        self.pool
            .read(move |conn| get_course_programs_sync(conn, &uid))
            .await
    }

    pub async fn distinct_course_semesters(&self) -> Result<Vec<Semester>> {
        self.pool.read(distinct_course_semesters_sync).await
    }

    pub async fn get_all_courses(&self) -> Result<Vec<Course>> {
        self.pool.read(get_all_courses_sync).await
    }

    pub async fn count_courses(&self) -> Result<i64> {
        self.pool.read(count_courses_sync).await
    }

    // ── Syllabi ──

    pub async fn get_syllabus(&self, uid: &str) -> Result<Option<Syllabus>> {
        let uid = uid.to_string();
        self.pool.read(move |conn| get_syllabus_sync(conn, &uid)).await
    }

    /// Returns true when the content hash changed (new row or new content).
    pub async fn save_syllabus(&self, syllabus: Syllabus) -> Result<bool> {
        let now = now_epoch();
        self.pool
            .write(move |conn| save_syllabus_sync(conn, &syllabus, now))
            .await
    }

    pub async fn distinct_semesters(&self) -> Result<Vec<Semester>> {
        self.pool.read(distinct_semesters_sync).await
    }

    pub async fn get_syllabi_by_semester(&self, semester: Semester) -> Result<Vec<Syllabus>> {
        self.pool
            .read(move |conn| get_syllabi_by_semester_sync(conn, semester))
            .await
    }

    pub async fn count_syllabi(&self) -> Result<i64> {
        self.pool.read(count_syllabi_sync).await
    }

    // ── Stickers ──

    pub async fn save_sticker(&self, sticker: Sticker) -> Result<()> {
        let now = now_epoch();
        self.pool
            .write(move |conn| save_sticker_sync(conn, &sticker, now))
            .await
    }

    pub async fn record_sticker_outcome(&self, url: &str, ok: bool) -> Result<()> {
        let url = url.to_string();
        self.pool
            .write(move |conn| record_sticker_outcome_sync(conn, &url, ok))
            .await
    }

    pub async fn get_all_stickers(&self) -> Result<Vec<Sticker>> {
        self.pool.read(get_all_stickers_sync).await
    }

    pub async fn pick_sticker(&self, seed: u64) -> Result<Option<Sticker>> {
        self.pool.read(move |conn| pick_sticker_sync(conn, seed)).await
    }

    pub async fn count_stickers(&self) -> Result<i64> {
        self.pool.read(count_stickers_sync).await
    }

    // ── Maintenance ──

    /// Delete rows older than the TTL bound. Returns the deleted count.
    pub async fn cleanup_expired(&self, ttl: Duration) -> Result<usize> {
        let now = now_epoch();
        self.pool
            .write(move |conn| cleanup_expired_sync(conn, ttl, now).map_err(Into::into))
            .await
    }

    /// Report-only integrity self-test.
    pub async fn integrity_check(&self) -> Result<std::result::Result<(), String>> {
        self.pool
            .read(|conn| Ok(retention::integrity_check_sync(conn)))
            .await
    }
}

use retention::cleanup_expired_sync;
