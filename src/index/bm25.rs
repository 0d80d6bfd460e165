// index/bm25.rs
// BM25 ranker for one semester's syllabi
//
// Each semester gets its own ranker with its own document count, IDF table
// and length normalization. Terms common in one semester but rare in
// another therefore weigh differently per semester, which keeps scores
// comparable within a query and stops a decade of curricula from
// contaminating each other's IDF.

use std::collections::HashMap;

use super::tokenize::tokenize;

/// BM25 parameters. Length normalization absorbs document-length variance
/// since syllabi are indexed whole (no chunking).
const K1: f64 = 1.5;
const B: f64 = 0.75;

/// One indexed syllabus.
#[derive(Debug, Clone)]
struct DocEntry {
    uid: String,
    title: String,
    len: usize,
    tf: HashMap<String, u32>,
}

/// A ranked hit with its raw BM25 score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub uid: String,
    pub title: String,
    pub score: f64,
}

/// BM25 ranker over one semester's corpus.
#[derive(Debug, Default, Clone)]
pub struct Bm25Ranker {
    docs: Vec<DocEntry>,
    df: HashMap<String, u32>,
    total_len: usize,
}

impl Bm25Ranker {
    /// Build from `(uid, title, body)` documents. Documents are sorted by
    /// uid internally so two builds from the same corpus rank identically
    /// regardless of insertion order.
    pub fn build<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        let mut ranker = Self::default();
        for (uid, title, body) in docs {
            ranker.push(uid, title, &body);
        }
        ranker.docs.sort_by(|a, b| a.uid.cmp(&b.uid));
        ranker
    }

    fn push(&mut self, uid: String, title: String, body: &str) {
        let tokens = tokenize(body);
        let len = tokens.len();
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *tf.entry(token).or_insert(0) += 1;
        }
        for term in tf.keys() {
            *self.df.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_len += len;
        self.docs.push(DocEntry { uid, title, len, tf });
    }

    /// Clone this ranker with one more document. Document frequencies and
    /// the corpus size change, so IDF shifts for the whole semester.
    pub fn with_doc(&self, uid: String, title: String, body: &str) -> Self {
        let mut next = self.clone();
        next.push(uid, title, body);
        next.docs.sort_by(|a, b| a.uid.cmp(&b.uid));
        next
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.docs.iter().any(|d| d.uid == uid)
    }

    /// Classic Robertson IDF. Goes negative when a term appears in more
    /// than half the corpus; the confidence conversion collapses negative
    /// totals to zero downstream.
    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = f64::from(self.df.get(term).copied().unwrap_or(0));
        ((n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Score every document against pre-tokenized query terms and return
    /// the top `n` hits, score descending, uid ascending on ties.
    pub fn top_n(&self, query_terms: &[String], n: usize) -> Vec<ScoredDoc> {
        if self.docs.is_empty() || query_terms.is_empty() || n == 0 {
            return Vec::new();
        }
        let avgdl = self.total_len as f64 / self.docs.len() as f64;

        let mut hits: Vec<ScoredDoc> = self
            .docs
            .iter()
            .filter_map(|doc| {
                let mut score = 0.0;
                let mut matched = false;
                for term in query_terms {
                    let tf = f64::from(doc.tf.get(term).copied().unwrap_or(0));
                    if tf == 0.0 {
                        continue;
                    }
                    matched = true;
                    let norm = K1 * (1.0 - B + B * doc.len as f64 / avgdl.max(f64::MIN_POSITIVE));
                    score += self.idf(term) * tf * (K1 + 1.0) / (tf + norm);
                }
                matched.then(|| ScoredDoc {
                    uid: doc.uid.clone(),
                    title: doc.title.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        hits.truncate(n);
        hits
    }
}
