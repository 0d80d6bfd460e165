// index/mod.rs
// Per-semester lexical index over cached syllabi

pub mod bm25;
pub mod tokenize;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::store::types::{Semester, Syllabus};
use crate::store::Store;
use bm25::Bm25Ranker;
use tokenize::tokenize;

/// Presentation tier cutoffs over the per-semester relative confidence.
pub const BEST_MATCH: f64 = 0.8;
pub const HIGHLY_RELEVANT: f64 = 0.6;

/// A course hit with its per-semester relative confidence in [0, 1]. The
/// top hit of each semester is exactly 1.0; confidences are not comparable
/// across queries.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseHit {
    pub uid: String,
    pub title: String,
    pub semester: Semester,
    pub confidence: f64,
}

impl CourseHit {
    /// Presentation tier label for the reply layer.
    pub fn tier(&self) -> &'static str {
        if self.confidence >= BEST_MATCH {
            "best"
        } else if self.confidence >= HIGHLY_RELEVANT {
            "high"
        } else {
            "partial"
        }
    }
}

/// Immutable snapshot of every semester ranker. Rebuilds construct a fresh
/// snapshot off-lock and install it with a pointer swap, so a search never
/// blocks behind a rebuild and never observes a half-built state.
#[derive(Default)]
struct Snapshot {
    semesters: BTreeMap<Semester, Arc<Bm25Ranker>>,
}

/// The in-memory lexical index, a pure function of the syllabus table.
pub struct CourseIndex {
    current: RwLock<Arc<Snapshot>>,
}

impl Default for CourseIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CourseIndex {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// The indexed string for one syllabus: title prefix plus the three
    /// free-text fields. One syllabus, one document.
    fn document_body(s: &Syllabus) -> String {
        format!("【{}】{} {} {}", s.title, s.objectives, s.outline, s.schedule)
    }

    /// Full rebuild, semester-chunked: each semester's syllabi are fetched,
    /// ranked and released before the next, so peak memory scales with the
    /// largest single semester.
    pub async fn rebuild_from_store(&self, store: &Store) -> Result<()> {
        let semesters = store.distinct_semesters().await?;
        let mut next = Snapshot::default();
        for semester in semesters {
            let syllabi = store.get_syllabi_by_semester(semester).await?;
            let ranker = Bm25Ranker::build(
                syllabi
                    .into_iter()
                    .map(|s| (s.uid.clone(), s.title.clone(), Self::document_body(&s))),
            );
            next.semesters.insert(semester, Arc::new(ranker));
        }
        self.install(next);
        Ok(())
    }

    /// Rebuild only the given semesters from the store, keeping every other
    /// ranker from the current snapshot.
    pub async fn rebuild_semesters(&self, store: &Store, changed: &[Semester]) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        let mut next = Snapshot {
            semesters: self.snapshot().semesters.clone(),
        };
        for &semester in changed {
            let syllabi = store.get_syllabi_by_semester(semester).await?;
            let ranker = Bm25Ranker::build(
                syllabi
                    .into_iter()
                    .map(|s| (s.uid.clone(), s.title.clone(), Self::document_body(&s))),
            );
            next.semesters.insert(semester, Arc::new(ranker));
        }
        self.install(next);
        Ok(())
    }

    /// Insert one syllabus, rebuilding only its semester's ranker (the
    /// semester's document count and IDF change; every other semester is
    /// untouched). A duplicate uid is a no-op.
    pub fn insert(&self, syllabus: &Syllabus) {
        let semester = syllabus.semester();
        let snapshot = self.snapshot();
        if let Some(ranker) = snapshot.semesters.get(&semester) {
            if ranker.contains(&syllabus.uid) {
                return;
            }
        }

        let ranker = match snapshot.semesters.get(&semester) {
            Some(existing) => existing.with_doc(
                syllabus.uid.clone(),
                syllabus.title.clone(),
                &Self::document_body(syllabus),
            ),
            None => Bm25Ranker::build([(
                syllabus.uid.clone(),
                syllabus.title.clone(),
                Self::document_body(syllabus),
            )]),
        };

        let mut next = Snapshot {
            semesters: snapshot.semesters.clone(),
        };
        next.semesters.insert(semester, Arc::new(ranker));
        self.install(next);
    }

    /// Total indexed documents across all semesters.
    pub fn count(&self) -> usize {
        self.snapshot().semesters.values().map(|r| r.len()).sum()
    }

    /// Semesters currently indexed, newest first.
    pub fn semesters(&self) -> Vec<Semester> {
        self.snapshot().semesters.keys().rev().copied().collect()
    }

    /// Ranked free-text search over the two newest semesters.
    ///
    /// Each semester is scored independently with its own ranker; raw BM25
    /// scores convert to per-semester relative confidence (`score / max`),
    /// negative raws collapsing to 0. Results are the two semesters' top-N
    /// lists concatenated, newest semester first.
    pub fn search_courses(&self, query: &str, top_n: usize) -> Vec<CourseHit> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let snapshot = self.snapshot();

        let mut hits = Vec::new();
        for (&semester, ranker) in snapshot.semesters.iter().rev().take(2) {
            let scored = ranker.top_n(&terms, top_n);
            let max_score = scored.first().map(|h| h.score).unwrap_or(0.0);
            for hit in scored {
                // Negative raw scores (IDF went negative) collapse to 0;
                // the semester's top hit is 1.0 by definition, which also
                // covers the max-score-exactly-zero corner.
                let confidence = if hit.score < 0.0 {
                    0.0
                } else if max_score > 0.0 {
                    (hit.score / max_score).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                hits.push(CourseHit {
                    uid: hit.uid,
                    title: hit.title,
                    semester,
                    confidence,
                });
            }
        }
        hits
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install(&self, next: Snapshot) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syllabus(uid: &str, year: i32, term: u8, title: &str, outline: &str) -> Syllabus {
        Syllabus {
            uid: uid.into(),
            title: title.into(),
            teachers: vec![],
            year,
            term,
            objectives: String::new(),
            outline: outline.into(),
            schedule: String::new(),
            content_hash: Syllabus::compute_hash(title, "", outline, ""),
            cached_at: 0,
        }
    }

    async fn seeded_store(syllabi: &[Syllabus]) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        for s in syllabi {
            store.save_syllabus(s.clone()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_rebuild_count_matches_store() {
        let store = seeded_store(&[
            syllabus("1131U0690", 113, 1, "雲端運算", "aws lambda 虛擬化"),
            syllabus("1131U0700", 113, 1, "資料結構", "樹 堆疊 雜湊"),
            syllabus("1122U0100", 112, 2, "作業系統", "行程 排程"),
        ])
        .await;

        let index = CourseIndex::new();
        index.rebuild_from_store(&store).await.unwrap();
        assert_eq!(index.count() as i64, store.count_syllabi().await.unwrap());
        assert_eq!(
            index.semesters(),
            vec![Semester::new(113, 1), Semester::new(112, 2)]
        );
    }

    #[tokio::test]
    async fn test_search_top_hit_confidence_one() {
        let store = seeded_store(&[
            syllabus("1131U0690", 113, 1, "雲端運算", "aws lambda 虛擬化"),
            syllabus("1131U0700", 113, 1, "資料結構", "樹 堆疊 雜湊"),
        ])
        .await;
        let index = CourseIndex::new();
        index.rebuild_from_store(&store).await.unwrap();

        let hits = index.search_courses("AWS", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "雲端運算");
        assert_eq!(hits[0].confidence, 1.0);
        assert_eq!(hits[0].tier(), "best");
    }

    #[tokio::test]
    async fn test_newest_two_semesters_only() {
        let store = seeded_store(&[
            syllabus("1141U0001", 114, 1, "甲課", "aws"),
            syllabus("1132U0002", 113, 2, "乙課", "aws"),
            syllabus("1131U0003", 113, 1, "丙課", "aws"),
            syllabus("1122U0004", 112, 2, "丁課", "aws"),
        ])
        .await;
        let index = CourseIndex::new();
        index.rebuild_from_store(&store).await.unwrap();

        let hits = index.search_courses("aws", 5);
        let semesters: std::collections::HashSet<Semester> =
            hits.iter().map(|h| h.semester).collect();
        assert_eq!(
            semesters,
            [Semester::new(114, 1), Semester::new(113, 2)].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_per_semester_independence() {
        let store = seeded_store(&[
            syllabus("1141U0001", 114, 1, "雲端運算", "aws 雲端"),
            syllabus("1141U0002", 114, 1, "資料結構", "樹 aws"),
            syllabus("1132U0003", 113, 2, "演算法", "圖 排序"),
        ])
        .await;
        let index = CourseIndex::new();
        index.rebuild_from_store(&store).await.unwrap();

        let before: Vec<_> = index
            .search_courses("aws", 5)
            .into_iter()
            .filter(|h| h.semester == Semester::new(114, 1))
            .collect();

        // Inserting into 113-2 must not change 114-1's ranking
        index.insert(&syllabus("1132U0004", 113, 2, "雲端服務", "aws aws aws"));

        let after: Vec<_> = index
            .search_courses("aws", 5)
            .into_iter()
            .filter(|h| h.semester == Semester::new(114, 1))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_incremental_insert_and_duplicate_noop() {
        let index = CourseIndex::new();
        let s = syllabus("1131U0690", 113, 1, "雲端運算", "aws");
        index.insert(&s);
        assert_eq!(index.count(), 1);

        // Duplicate uid is a no-op
        index.insert(&s);
        assert_eq!(index.count(), 1);

        index.insert(&syllabus("1131U0700", 113, 1, "資料結構", "樹"));
        assert_eq!(index.count(), 2);
        assert_eq!(index.search_courses("aws", 5).len(), 1);
    }

    #[tokio::test]
    async fn test_negative_scores_collapse_to_zero() {
        // "課" appears in every document, driving IDF (and the raw score)
        // negative; confidences must still land in [0, 1].
        let index = CourseIndex::new();
        index.insert(&syllabus("1131U0001", 113, 1, "甲", "課 程 一"));
        index.insert(&syllabus("1131U0002", 113, 1, "乙", "課 程 二"));
        index.insert(&syllabus("1131U0003", 113, 1, "丙", "課 程 三"));

        let hits = index.search_courses("課", 5);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.confidence == 0.0));
    }

    #[tokio::test]
    async fn test_rebuild_determinism() {
        let docs = [
            syllabus("1131U0690", 113, 1, "雲端運算", "aws 雲端 運算 服務"),
            syllabus("1131U0700", 113, 1, "資料結構", "樹 結構 aws"),
            syllabus("1131U0800", 113, 1, "演算法", "圖 aws 排序"),
        ];
        let forward = seeded_store(&docs).await;
        let mut reversed = docs.clone();
        reversed.reverse();
        let backward = seeded_store(&reversed).await;

        let a = CourseIndex::new();
        a.rebuild_from_store(&forward).await.unwrap();
        let b = CourseIndex::new();
        b.rebuild_from_store(&backward).await.unwrap();

        assert_eq!(a.search_courses("aws 結構", 10), b.search_courses("aws 結構", 10));
    }

    #[tokio::test]
    async fn test_rebuild_semesters_partial() {
        let store = seeded_store(&[
            syllabus("1131U0690", 113, 1, "雲端運算", "aws"),
            syllabus("1122U0100", 112, 2, "作業系統", "行程"),
        ])
        .await;
        let index = CourseIndex::new();
        index.rebuild_from_store(&store).await.unwrap();

        // Add a syllabus to the store, then rebuild only its semester
        store
            .save_syllabus(syllabus("1131U0700", 113, 1, "資料結構", "樹"))
            .await
            .unwrap();
        index
            .rebuild_semesters(&store, &[Semester::new(113, 1)])
            .await
            .unwrap();
        assert_eq!(index.count(), 3);
    }
}
