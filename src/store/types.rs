// store/types.rs
// Cached entity records

use serde::{Deserialize, Serialize};

/// Academic `(year, term)` pair. Year is the Republic-of-China calendar
/// (ROC year = AD year − 1911); term 3 is the summer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Semester {
    pub year: i32,
    pub term: u8,
}

impl Semester {
    pub fn new(year: i32, term: u8) -> Self {
        Self { year, term }
    }
}

impl std::fmt::Display for Semester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.year, self.term)
    }
}

/// A student record scraped from the enrollment pages. Immutable once
/// scraped except for the cache stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    /// 8-9 digit student number
    pub id: String,
    pub name: String,
    /// ROC calendar entry year
    pub year: i32,
    pub department: String,
    /// Epoch seconds of the last write
    pub cached_at: i64,
}

/// Organization or individual contact from the campus directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub uid: String,
    pub kind: ContactKind,
    pub name: String,
    pub organization: String,
    pub superior: String,
    pub title: String,
    pub phone: String,
    pub extension: String,
    pub email: String,
    pub location: String,
    pub website: String,
    pub cached_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactKind {
    Organization,
    Individual,
}

impl ContactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactKind::Organization => "organization",
            ContactKind::Individual => "individual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "organization" => Some(ContactKind::Organization),
            "individual" => Some(ContactKind::Individual),
            _ => None,
        }
    }
}

/// A course offering. `uid` is `{year:03}{term}{no}`; the fixed-width
/// prefix keeps the decomposition into `(year, term, no)` unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub uid: String,
    pub year: i32,
    pub term: u8,
    pub no: String,
    pub title: String,
    pub teachers: Vec<String>,
    pub credits: String,
    pub time: String,
    pub location: String,
    /// Raw eligible-class strings; the program relation is synthesized
    /// from this field at save time.
    pub eligible: String,
    pub cached_at: i64,
}

/// Build a course uid from its parts.
pub fn course_uid(year: i32, term: u8, no: &str) -> String {
    format!("{year:03}{term}{no}")
}

/// Decompose a course uid into `(year, term, no)`. Returns None when the
/// uid is malformed.
pub fn split_course_uid(uid: &str) -> Option<(i32, u8, &str)> {
    if uid.len() < 5 || !uid.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let year: i32 = uid[..3].parse().ok()?;
    let term: u8 = uid[3..4].parse().ok()?;
    Some((year, term, &uid[4..]))
}

impl Course {
    pub fn semester(&self) -> Semester {
        Semester::new(self.year, self.term)
    }
}

/// Course syllabus, one row per course offering (3-field merged schema:
/// objectives, outline, schedule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Syllabus {
    /// Equal to the owning course's uid
    pub uid: String,
    pub title: String,
    pub teachers: Vec<String>,
    pub year: i32,
    pub term: u8,
    pub objectives: String,
    pub outline: String,
    pub schedule: String,
    /// SHA-256 over the normalized field concatenation; unchanged hash
    /// means the index entry is reusable.
    pub content_hash: String,
    pub cached_at: i64,
}

impl Syllabus {
    pub fn semester(&self) -> Semester {
        Semester::new(self.year, self.term)
    }

    /// Compute the content hash over the normalized fields.
    pub fn compute_hash(title: &str, objectives: &str, outline: &str, schedule: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for field in [title, objectives, outline, schedule] {
            hasher.update(field.trim().as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Cached sticker with diagnostic counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sticker {
    pub url: String,
    pub source: String,
    pub cached_at: i64,
    pub hits: i64,
    pub failures: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_uid_round_trip() {
        let uid = course_uid(113, 1, "U0690");
        assert_eq!(uid, "1131U0690");
        let (year, term, no) = split_course_uid(&uid).unwrap();
        assert_eq!((year, term, no), (113, 1, "U0690"));
    }

    #[test]
    fn test_split_course_uid_malformed() {
        assert!(split_course_uid("").is_none());
        assert!(split_course_uid("113").is_none());
        assert!(split_course_uid("1131").is_none());
        assert!(split_course_uid("abcdU0690").is_none());
    }

    #[test]
    fn test_semester_ordering() {
        let older = Semester::new(112, 2);
        let newer = Semester::new(113, 1);
        assert!(newer > older);
        assert!(Semester::new(113, 2) > Semester::new(113, 1));
        assert_eq!(Semester::new(113, 1).to_string(), "113-1");
    }

    #[test]
    fn test_content_hash_stable() {
        let a = Syllabus::compute_hash("t", "obj", "out", "sched");
        let b = Syllabus::compute_hash("t", "obj", "out", "sched");
        let c = Syllabus::compute_hash("t", "obj2", "out", "sched");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_content_hash_field_boundaries() {
        // Concatenation must not collide across field boundaries
        let a = Syllabus::compute_hash("ab", "c", "", "");
        let b = Syllabus::compute_hash("a", "bc", "", "");
        assert_ne!(a, b);
    }
}
