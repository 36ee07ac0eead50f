//! In-memory Okapi BM25
//!
//! A fresh index is built per query over the enumerated target documents,
//! bounded upstream by the retriever's document cap. Parameters follow the
//! common Okapi defaults (k1=1.5, b=0.75) with an epsilon floor that keeps
//! very common terms from going negative.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid regex"));

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

/// Lowercased word tokens
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

pub struct Bm25Index {
    term_freqs: Vec<HashMap<String, f64>>,
    doc_lens: Vec<f64>,
    avg_doc_len: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    /// Build an index over tokenized documents
    pub fn new(tokenized_docs: &[Vec<String>]) -> Self {
        let n = tokenized_docs.len();
        let mut term_freqs = Vec::with_capacity(n);
        let mut doc_lens = Vec::with_capacity(n);
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for tokens in tokenized_docs {
            doc_lens.push(tokens.len() as f64);
            let mut freqs: HashMap<String, f64> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0.0) += 1.0;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(freqs);
        }

        let avg_doc_len = if n > 0 {
            doc_lens.iter().sum::<f64>() / n as f64
        } else {
            0.0
        };

        // idf with a floor: terms in most documents would otherwise score
        // negative and drag down every match they appear in
        let mut idf = HashMap::with_capacity(doc_freq.len());
        let mut idf_sum = 0.0;
        let mut negative_terms = Vec::new();
        for (term, df) in &doc_freq {
            let value = ((n as f64 - *df as f64 + 0.5) / (*df as f64 + 0.5)).ln();
            idf_sum += value;
            if value < 0.0 {
                negative_terms.push(term.clone());
            }
            idf.insert(term.clone(), value);
        }
        let average_idf = if idf.is_empty() {
            0.0
        } else {
            idf_sum / idf.len() as f64
        };
        let floor = EPSILON * average_idf;
        for term in negative_terms {
            idf.insert(term, floor);
        }

        Self {
            term_freqs,
            doc_lens,
            avg_doc_len,
            idf,
        }
    }

    /// Score every document against the tokenized query
    pub fn get_scores(&self, query_tokens: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.term_freqs.len()];
        if self.avg_doc_len == 0.0 {
            return scores;
        }
        for token in query_tokens {
            let Some(idf) = self.idf.get(token) else {
                continue;
            };
            for (i, freqs) in self.term_freqs.iter().enumerate() {
                let Some(freq) = freqs.get(token) else {
                    continue;
                };
                let norm = K1 * (1.0 - B + B * self.doc_lens[i] / self.avg_doc_len);
                scores[i] += idf * (freq * (K1 + 1.0)) / (freq + norm);
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Back Squat: 4x8 @ 70%!"),
            vec!["back", "squat", "4x8", "70"]
        );
        assert!(tokenize("...").is_empty());
    }

    #[test]
    fn test_matching_doc_scores_highest() {
        let docs = vec![
            tokenize("progressive overload drives hypertrophy over time"),
            tokenize("the cat sat on the mat"),
            tokenize("hypertrophy training uses moderate loads"),
        ];
        let index = Bm25Index::new(&docs);
        let scores = index.get_scores(&tokenize("hypertrophy training"));
        assert!(scores[2] > scores[0]);
        assert!(scores[0] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn test_empty_corpus() {
        let index = Bm25Index::new(&[]);
        assert!(index.get_scores(&tokenize("anything")).is_empty());
    }

    #[test]
    fn test_rare_term_outweighs_common() {
        let docs: Vec<Vec<String>> = (0..10)
            .map(|i| {
                if i == 0 {
                    tokenize("training deadlift specialization")
                } else {
                    tokenize("training general advice")
                }
            })
            .collect();
        let index = Bm25Index::new(&docs);
        let scores = index.get_scores(&tokenize("deadlift"));
        assert!(scores[0] > 0.0);
        assert!(scores[1..].iter().all(|s| *s == 0.0));
    }
}
