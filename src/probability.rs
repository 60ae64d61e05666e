//! Probability sentinels and the unigram/bigram score combiner.

/// Absence sentinel for any probability query.
pub const NOT_A_PROBABILITY: i32 = -1;

/// Highest encodable probability.
pub const MAX_PROBABILITY: i32 = 255;

/// Zero timestamp means "unset"; the façade stamps it with the logical clock.
pub const NOT_A_TIMESTAMP: u32 = 0;

/// Combine a unigram probability with the probability of the bigram edge
/// leading to the word.
///
/// Absent unigram poisons the result; an absent bigram backs off to the
/// plain unigram probability. Otherwise the bigram probability selects a
/// step inside the remaining headroom `[unigram, 255]`, so the result is
/// monotonic in both inputs. Integer arithmetic keeps the table identical
/// across platforms.
pub fn combine(unigram_probability: i32, bigram_probability: i32) -> i32 {
    if unigram_probability == NOT_A_PROBABILITY {
        return NOT_A_PROBABILITY;
    }
    if bigram_probability == NOT_A_PROBABILITY {
        return unigram_probability;
    }
    let u = unigram_probability.clamp(0, MAX_PROBABILITY);
    let b = bigram_probability.clamp(0, MAX_PROBABILITY);
    // (b + 1) steps of size (255 - u) * 2 / 513, i.e. the headroom divided
    // into 256.5 steps.
    u + ((b + 1) * (MAX_PROBABILITY - u) * 2) / 513
}
