//! Okapi BM25 over the per-user corpus.
//!
//! Tokenization is lowercased whitespace/punctuation splitting; IDF is
//! corpus-wide. Also provides the bounded text-similarity used by the
//! reflector's duplicate and promotion checks.

use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Lowercased alphanumeric tokens, minimum 2 characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(String::from)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct DocEntry {
    key: String,
    len: usize,
    tf: HashMap<String, u32>,
}

#[derive(Default)]
pub struct Bm25Index {
    docs: Vec<DocEntry>,
    /// term -> number of docs containing it.
    df: HashMap<String, u32>,
    total_len: usize,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_doc(&mut self, key: &str, text: &str) {
        let tokens = tokenize(text);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_insert(0) += 1;
        }
        for term in tf.keys() {
            *self.df.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_len += tokens.len();
        self.docs.push(DocEntry {
            key: key.to_string(),
            len: tokens.len(),
            tf,
        });
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        (((n - df + 0.5) / (df + 0.5)) + 1.0).ln()
    }

    fn avg_len(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.docs.len() as f64
        }
    }

    /// Score all docs against a query; positive scores only, descending.
    /// Ties break on the key for determinism.
    pub fn search(&self, query: &str) -> Vec<(String, f64)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }
        let avg_len = self.avg_len();

        let mut scored: Vec<(String, f64)> = self
            .docs
            .iter()
            .filter_map(|doc| {
                let mut score = 0.0;
                for term in &terms {
                    let tf = doc.tf.get(term).copied().unwrap_or(0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let norm = K1 * (1.0 - B + B * doc.len as f64 / avg_len);
                    score += self.idf(term) * (tf * (K1 + 1.0)) / (tf + norm);
                }
                (score > 0.0).then(|| (doc.key.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bounded similarity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded [0, 1] lexical similarity between two texts: cosine over term
/// frequencies. Used where the reflector thresholds similarity (known-fact
/// suppression at 0.8, promotion matching at 0.7).
pub fn similarity(a: &str, b: &str) -> f64 {
    let tf = |text: &str| -> HashMap<String, f64> {
        let mut m = HashMap::new();
        for token in tokenize(text) {
            *m.entry(token).or_insert(0.0) += 1.0;
        }
        m
    };
    let ta = tf(a);
    let tb = tf(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let dot: f64 = ta
        .iter()
        .filter_map(|(term, wa)| tb.get(term).map(|wb| wa * wb))
        .sum();
    let norm = |m: &HashMap<String, f64>| m.values().map(|w| w * w).sum::<f64>().sqrt();
    let denominator = norm(&ta) * norm(&tb);
    if denominator == 0.0 {
        0.0
    } else {
        dot / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Find the Cheapest RTX-4060 laptop!"),
            vec!["find", "the", "cheapest", "rtx", "4060", "laptop"]
        );
    }

    #[test]
    fn search_ranks_by_relevance() {
        let mut index = Bm25Index::new();
        index.add_doc("a", "gaming laptop with nvidia gpu, great laptop");
        index.add_doc("b", "mechanical keyboard reviews");
        index.add_doc("c", "laptop stand for desks");

        let hits = index.search("gaming laptop");
        assert_eq!(hits[0].0, "a");
        assert!(hits.iter().all(|(k, _)| k != "b"));
    }

    #[test]
    fn rarer_terms_score_higher() {
        let mut index = Bm25Index::new();
        index.add_doc("common1", "laptop laptop laptop");
        index.add_doc("common2", "laptop deals");
        index.add_doc("rare", "laptop with thunderbolt dock");

        // "thunderbolt" appears in one doc; it dominates the combined query.
        let hits = index.search("laptop thunderbolt");
        assert_eq!(hits[0].0, "rare");
    }

    #[test]
    fn empty_query_or_corpus_is_empty() {
        let mut index = Bm25Index::new();
        assert!(index.search("anything").is_empty());
        index.add_doc("a", "some text");
        assert!(index.search("").is_empty());
        assert!(index.search("zzz").is_empty());
    }

    #[test]
    fn deterministic_tie_break() {
        let mut index = Bm25Index::new();
        index.add_doc("b", "same words here");
        index.add_doc("a", "same words here");
        let hits = index.search("same words");
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "b");
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity("user prefers amd gpus", "user prefers amd gpus") - 1.0).abs() < 1e-9);
        assert_eq!(similarity("totally different words", "unrelated phrase entirely"), 0.0);
        let partial = similarity(
            "user prefers refurbished laptops",
            "refurbished laptops are preferred",
        );
        assert!(partial > 0.3 && partial < 1.0);
    }

    #[test]
    fn similarity_empty_is_zero() {
        assert_eq!(similarity("", "anything"), 0.0);
    }
}
