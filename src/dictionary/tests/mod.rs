mod batch;
mod migration;

use crate::dictionary::Dictionary;
use crate::header::FORMAT_VERSION_4;
use crate::word_store::{BigramProperty, HistoricalInfo, UnigramProperty};

pub(crate) fn cps(word: &str) -> Vec<u32> {
    word.chars().map(|c| c as u32).collect()
}

pub(crate) fn word_string(codepoints: &[u32]) -> String {
    crate::codec::codepoints_to_string(codepoints)
}

pub(crate) fn new_dict() -> Dictionary {
    new_dict_at(FORMAT_VERSION_4)
}

pub(crate) fn new_dict_at(format_version: u16) -> Dictionary {
    Dictionary::create_on_memory(
        format_version,
        "en_US",
        &[
            ("dictionary".to_string(), "main:en_US".to_string()),
            ("version".to_string(), "42".to_string()),
            ("date".to_string(), "1400000000".to_string()),
        ],
    )
    .unwrap()
}

pub(crate) fn add_word(dict: &mut Dictionary, word: &str, probability: u8) -> bool {
    dict.add_unigram_word(&cps(word), &UnigramProperty::new(probability))
}

pub(crate) fn add_bigram(dict: &mut Dictionary, word0: &str, word1: &str, probability: u8) -> bool {
    dict.add_bigram_words(
        &cps(word0),
        &BigramProperty {
            target_codepoints: cps(word1),
            probability,
            historical: HistoricalInfo::new(0, 1, 0),
        },
    )
}

/// Dump all words through the iteration token protocol.
pub(crate) fn dump_words(dict: &Dictionary) -> Vec<String> {
    let mut words = Vec::new();
    let mut token = 0u64;
    loop {
        let (word, next_token) = dict.get_next_word_and_next_token(token);
        let Some(word) = word else {
            break;
        };
        words.push(word_string(&word));
        if next_token == 0 {
            break;
        }
        token = next_token;
    }
    words
}
