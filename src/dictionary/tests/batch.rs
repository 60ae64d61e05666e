use crate::dictionary::DictionaryEntry;
use crate::probability::NOT_A_PROBABILITY;

use super::{cps, new_dict};

fn entry(word0: Option<&str>, word1: &str, unigram: u8, bigram: u8) -> DictionaryEntry {
    DictionaryEntry {
        word0: word0.map(cps),
        word1: cps(word1),
        unigram_probability: unigram,
        bigram_probability: bigram,
        shortcut_target: None,
        shortcut_probability: 0,
        is_not_a_word: false,
        is_blacklisted: false,
        timestamp: 1234,
    }
}

#[test]
fn small_batch_completes() {
    let mut dict = new_dict();
    let entries = vec![
        entry(None, "good", 100, 0),
        entry(None, "morning", 80, 0),
        entry(Some("good"), "morning", 80, 180),
        entry(None, "night", 70, 0),
    ];
    assert_eq!(dict.add_multiple_dictionary_entries(&entries, 0), entries.len());
    assert_eq!(dict.get_probability(&cps("good")), 100);
    assert_eq!(dict.get_probability(&cps("night")), 70);
    assert_eq!(dict.get_bigram_probability(&cps("good"), &cps("morning")), 180);
}

#[test]
fn batch_entry_with_shortcut() {
    let mut dict = new_dict();
    let mut e = entry(None, "color", 90, 0);
    e.shortcut_target = Some(cps("colour"));
    e.shortcut_probability = 14;
    assert_eq!(dict.add_multiple_dictionary_entries(&[e], 0), 1);
    let property = dict.get_word_property(&cps("color")).unwrap();
    assert_eq!(property.shortcuts().len(), 1);
    assert_eq!(property.shortcuts()[0].target_codepoints, cps("colour"));
    assert_eq!(property.shortcuts()[0].probability, 14);
}

#[test]
fn out_of_range_start_index_is_a_no_op() {
    let mut dict = new_dict();
    let entries = vec![entry(None, "word", 10, 0)];
    assert_eq!(dict.add_multiple_dictionary_entries(&entries, 1), 0);
    assert_eq!(dict.add_multiple_dictionary_entries(&[], 0), 0);
    assert_eq!(dict.get_probability(&cps("word")), NOT_A_PROBABILITY);
}

#[test]
fn bigram_entry_before_its_source_fails_only_the_bigram() {
    let mut dict = new_dict();
    // word0 never added as a unigram: the bigram part is skipped but the
    // batch continues.
    let entries = vec![
        entry(Some("missing"), "target", 50, 120),
        entry(None, "after", 60, 0),
    ];
    assert_eq!(dict.add_multiple_dictionary_entries(&entries, 0), entries.len());
    assert_eq!(dict.get_probability(&cps("target")), 50);
    assert_eq!(dict.get_probability(&cps("after")), 60);
    assert_eq!(
        dict.get_bigram_probability(&cps("missing"), &cps("target")),
        NOT_A_PROBABILITY
    );
}

/// A large batch fragments the stores enough that the implementation hands
/// control back for a GC; resuming from the returned index must eventually
/// process every entry.
#[test]
fn large_batch_pauses_for_gc_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.dict");

    let mut words: Vec<String> = Vec::new();
    for i in 0..3_000usize {
        words.push(format!("w{i:05}"));
    }
    let mut entries = Vec::new();
    for (i, word) in words.iter().enumerate() {
        let prev = if i == 0 { None } else { Some(words[i - 1].as_str()) };
        entries.push(entry(prev, word, 100, 120));
    }

    let mut dict = new_dict();
    let mut index = 0usize;
    let mut rounds = 0usize;
    let mut paused = false;
    while index < entries.len() {
        let next = dict.add_multiple_dictionary_entries(&entries, index);
        assert!(next > index, "batch made no progress at {index}");
        if next < entries.len() {
            paused = true;
            dict.flush_with_gc(&path).unwrap();
        }
        index = next;
        rounds += 1;
        assert!(rounds < 1_000, "batch did not converge");
    }
    assert!(paused, "a batch this large should have requested GC");

    for (i, word) in words.iter().enumerate() {
        assert_eq!(dict.get_probability(&cps(word)), 100, "word {word}");
        if i > 0 {
            assert_eq!(
                dict.get_bigram_probability(&cps(&words[i - 1]), &cps(word)),
                120
            );
        }
    }
    assert_eq!(super::dump_words(&dict).len(), words.len());
}
