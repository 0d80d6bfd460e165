// scrape/sites.rs
// Logical upstream sites and their mirror base URLs

use std::collections::HashMap;

/// A logical upstream "site". Each maps to an ordered list of mirror base
/// URLs; the client fails over down the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Site {
    /// Student enrollment query pages
    Enrollment,
    /// Campus phone/email directory
    Directory,
    /// Course catalog and syllabus pages
    Courses,
    /// Community sticker board
    Stickers,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Enrollment => "enrollment",
            Site::Directory => "directory",
            Site::Courses => "courses",
            Site::Stickers => "stickers",
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default mirror lists. Order matters: the first entry is the primary, the
/// readiness probe targets it, and failover walks the list left to right.
pub fn default_base_urls() -> HashMap<Site, Vec<String>> {
    HashMap::from([
        (
            Site::Enrollment,
            vec![
                "https://sea.cc.ntpu.edu.tw".to_string(),
                "https://sea1.cc.ntpu.edu.tw".to_string(),
            ],
        ),
        (
            Site::Directory,
            vec![
                "https://sa.ntpu.edu.tw".to_string(),
                "https://new.ntpu.edu.tw".to_string(),
            ],
        ),
        (
            Site::Courses,
            vec![
                "https://sea.cc.ntpu.edu.tw".to_string(),
                "https://cof.ntpu.edu.tw".to_string(),
            ],
        ),
        (Site::Stickers, vec!["https://stickers.moe".to_string()]),
    ])
}
