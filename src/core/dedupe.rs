//! Near-duplicate rejection over the last K posted texts.
//!
//! Similarity is Jaccard over character trigrams of a normalised form
//! (whitespace collapsed, lowercased, first 512 chars). Cheap enough to run
//! on every candidate without tokenisation or external models.

use std::collections::{HashSet, VecDeque};

/// Collapse whitespace runs to single spaces, lowercase, and cap at 512 chars.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(512));
    let mut count = 0usize;
    let mut last_was_space = true; // leading whitespace is dropped
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                count += 1;
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
                count += 1;
            }
            last_was_space = false;
        }
        if count >= 512 {
            break;
        }
    }
    let trimmed = out.trim_end().to_string();
    trimmed.chars().take(512).collect()
}

fn trigrams(t: &str) -> HashSet<String> {
    let chars: Vec<char> = t.chars().collect();
    let mut grams = HashSet::new();
    if chars.is_empty() {
        return grams;
    }
    let end = chars.len().saturating_sub(2).max(1);
    for i in 0..end {
        let gram: String = chars[i..(i + 3).min(chars.len())].iter().collect();
        grams.insert(gram);
    }
    grams
}

/// Jaccard similarity of the character trigram sets of two normalised texts.
/// Returns 0.0 when either gram set is empty (fail open).
pub fn similarity(a: &str, b: &str) -> f64 {
    let ga = trigrams(&normalize(a));
    let gb = trigrams(&normalize(b));
    if ga.is_empty() || gb.is_empty() {
        return 0.0;
    }
    let intersection = ga.intersection(&gb).count();
    let union = ga.union(&gb).count();
    intersection as f64 / union as f64
}

/// Bounded FIFO of recent normalised texts; rejects candidates too close to
/// anything still buffered.
pub struct NearDuplicateFilter {
    k: usize,
    threshold: f64,
    buf: VecDeque<String>,
}

impl NearDuplicateFilter {
    pub fn new(k: usize, threshold: f64) -> Self {
        Self {
            k: k.max(1),
            threshold,
            buf: VecDeque::new(),
        }
    }

    /// Returns false iff `text` is a near-duplicate of a buffered entry.
    /// On permit the text is remembered.
    pub fn permit(&mut self, text: &str) -> bool {
        for prev in &self.buf {
            if similarity(prev, text) >= self.threshold {
                return false;
            }
        }
        if self.buf.len() == self.k {
            self.buf.pop_front();
        }
        self.buf.push_back(text.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize, similarity, NearDuplicateFilter};

    #[test]
    fn normalization_collapses_whitespace() {
        assert_eq!(normalize("  Hello\n\tWORLD  "), "hello world");
    }

    #[test]
    fn identical_texts_have_full_similarity() {
        assert!((similarity("good morning", "good morning") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_text_fails_open() {
        assert_eq!(similarity("", "anything"), 0.0);
        let mut filter = NearDuplicateFilter::new(4, 0.9);
        assert!(filter.permit(""));
        assert!(filter.permit(""));
    }

    #[test]
    fn close_variants_are_rejected() {
        let mut filter = NearDuplicateFilter::new(8, 0.9);
        assert!(filter.permit("Tomorrow will be sunny with a high of 25C"));
        assert!(!filter.permit("Tomorrow will be sunny with a high of 25C!"));
    }

    #[test]
    fn distinct_texts_pass() {
        let mut filter = NearDuplicateFilter::new(8, 0.9);
        assert!(filter.permit("Tomorrow will be sunny"));
        assert!(filter.permit("Breaking: local news digest for today"));
    }

    #[test]
    fn buffer_evicts_oldest() {
        let mut filter = NearDuplicateFilter::new(2, 0.95);
        assert!(filter.permit("first message body"));
        assert!(filter.permit("second message body here"));
        assert!(filter.permit("third different message"));
        // "first message body" has been evicted, so an exact repeat passes
        assert!(filter.permit("first message body"));
    }
}
