//! Interface consumed by the external suggestion engines.
//!
//! The typing and gesture searchers live outside this crate; the dictionary
//! only defines what they are handed (tap input, a per-query traversal
//! session) and what they fill (a bounded, score-ordered result collector),
//! plus the trait the façade dispatches through.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::dictionary::Dictionary;
use crate::word_store::MAX_WORD_LENGTH;

/// Most results a single query returns.
pub const MAX_RESULTS: usize = 18;

/// Options the host passes with each suggestion query.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuggestOptions {
    pub is_gesture: bool,
    pub block_offensive_words: bool,
    pub space_aware_gesture: bool,
}

impl SuggestOptions {
    pub fn is_gesture(&self) -> bool {
        self.is_gesture
    }
}

/// Raw tap or gesture-point input: parallel arrays of size `len()`.
#[derive(Debug, Clone, Copy)]
pub struct TapInput<'a> {
    pub x_coordinates: &'a [i32],
    pub y_coordinates: &'a [i32],
    pub times: &'a [i32],
    pub pointer_ids: &'a [i32],
    pub codepoints: &'a [u32],
}

impl TapInput<'_> {
    pub fn len(&self) -> usize {
        self.codepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codepoints.is_empty()
    }
}

/// Per-query traversal state. Re-initialised by the façade before the
/// engine runs; engines keep their scratch here between expansion steps.
#[derive(Debug, Default)]
pub struct TraverseSession {
    prev_word: Vec<u32>,
    options: SuggestOptions,
}

impl TraverseSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, prev_word: &[u32], options: &SuggestOptions) {
        self.prev_word.clear();
        if prev_word.len() <= MAX_WORD_LENGTH {
            self.prev_word.extend_from_slice(prev_word);
        }
        self.options = *options;
    }

    pub fn prev_word(&self) -> &[u32] {
        &self.prev_word
    }

    pub fn options(&self) -> &SuggestOptions {
        &self.options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedWord {
    pub codepoints: Vec<u32>,
    pub score: i32,
}

impl Ord for SuggestedWord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.codepoints.cmp(&self.codepoints))
    }
}

impl PartialOrd for SuggestedWord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded collector: keeps the `capacity` highest-scored words.
#[derive(Debug)]
pub struct SuggestionResults {
    capacity: usize,
    heap: BinaryHeap<Reverse<SuggestedWord>>,
}

impl SuggestionResults {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    pub fn push(&mut self, codepoints: &[u32], score: i32) {
        if codepoints.is_empty() || codepoints.len() > MAX_WORD_LENGTH || self.capacity == 0 {
            return;
        }
        let word = SuggestedWord {
            codepoints: codepoints.to_vec(),
            score,
        };
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(word));
            return;
        }
        if let Some(Reverse(worst)) = self.heap.peek() {
            if word > *worst {
                self.heap.pop();
                self.heap.push(Reverse(word));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain into a vector ordered best-first.
    pub fn into_sorted_vec(self) -> Vec<SuggestedWord> {
        let mut words: Vec<SuggestedWord> = self.heap.into_iter().map(|Reverse(w)| w).collect();
        words.sort_by(|a, b| b.cmp(a));
        words
    }
}

/// A suggestion searcher (typing or gesture). Implementations live outside
/// this crate and are registered on the dictionary façade.
pub trait SuggestEngine: Send {
    fn get_suggestions(
        &self,
        dictionary: &Dictionary,
        session: &mut TraverseSession,
        input: &TapInput<'_>,
        language_weight: f32,
        out: &mut SuggestionResults,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_keeps_top_scores() {
        let mut results = SuggestionResults::new(3);
        for (i, score) in [10, 50, 20, 40, 30].iter().enumerate() {
            results.push(&[b'a' as u32 + i as u32], *score);
        }
        let words = results.into_sorted_vec();
        let scores: Vec<i32> = words.iter().map(|w| w.score).collect();
        assert_eq!(scores, vec![50, 40, 30]);
    }

    #[test]
    fn collector_rejects_invalid_words() {
        let mut results = SuggestionResults::new(4);
        results.push(&[], 100);
        results.push(&vec![65u32; MAX_WORD_LENGTH + 1], 100);
        assert!(results.is_empty());
    }

    #[test]
    fn tie_break_is_deterministic() {
        let mut a = SuggestionResults::new(2);
        a.push(&[66], 10);
        a.push(&[65], 10);
        a.push(&[67], 10);
        let words = a.into_sorted_vec();
        // Equal scores order lexicographically, lowest codepoints first.
        assert_eq!(words[0].codepoints, vec![65]);
        assert_eq!(words[1].codepoints, vec![66]);
    }
}
