use crate::dictionary::{DictError, Dictionary};
use crate::header::{FORMAT_VERSION_4, FORMAT_VERSION_5};
use crate::word_store::{HistoricalInfo, ShortcutProperty, UnigramProperty};

use super::{add_bigram, add_word, cps, new_dict_at};

fn build_source() -> Dictionary {
    let mut dict = new_dict_at(FORMAT_VERSION_4);
    let unigram = UnigramProperty {
        probability: 90,
        is_not_a_word: false,
        is_blacklisted: false,
        historical: HistoricalInfo::new(1, 4, 555),
        shortcuts: vec![ShortcutProperty {
            target_codepoints: cps("you"),
            probability: 14,
        }],
    };
    assert!(dict.add_unigram_word(&cps("u"), &unigram));
    assert!(add_word(&mut dict, "good", 100));
    assert!(add_word(&mut dict, "morning", 80));
    assert!(add_word(&mut dict, "goodness", 40));
    assert!(add_bigram(&mut dict, "good", "morning", 180));
    assert!(add_bigram(&mut dict, "good", "goodness", 60));
    assert!(add_bigram(&mut dict, "u", "good", 120));
    dict
}

#[test]
fn migrate_to_next_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("migrated.dict");
    let source = build_source();
    let expected_words = super::dump_words(&source);
    let expected_u = source.get_word_property(&cps("u")).unwrap();

    let migrated = source.migrate(&path, FORMAT_VERSION_5).unwrap();
    assert_eq!(migrated.format_version(), FORMAT_VERSION_5);

    // The source handle is untouched.
    assert_eq!(source.format_version(), FORMAT_VERSION_4);
    assert_eq!(super::dump_words(&source), expected_words);

    // The migrated file reopens at the new version with everything intact.
    let reopened = Dictionary::open(&path, true).unwrap();
    assert_eq!(reopened.format_version(), FORMAT_VERSION_5);
    assert_eq!(reopened.header().locale(), "en_US");
    assert!(!reopened.is_corrupted());
    assert_eq!(super::dump_words(&reopened), expected_words);

    for (word, probability) in [("good", 100), ("morning", 80), ("goodness", 40), ("u", 90)] {
        assert_eq!(reopened.get_probability(&cps(word)), probability, "{word}");
    }
    assert_eq!(
        reopened.get_bigram_probability(&cps("good"), &cps("morning")),
        180
    );
    assert_eq!(
        reopened.get_bigram_probability(&cps("good"), &cps("goodness")),
        60
    );
    assert_eq!(reopened.get_bigram_probability(&cps("u"), &cps("good")), 120);

    let migrated_u = reopened.get_word_property(&cps("u")).unwrap();
    assert_eq!(migrated_u, expected_u);
}

#[test]
fn migrate_same_version_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("same.dict");
    let source = build_source();
    let migrated = source.migrate(&path, FORMAT_VERSION_4).unwrap();
    assert_eq!(migrated.format_version(), FORMAT_VERSION_4);
    assert_eq!(super::dump_words(&migrated), super::dump_words(&source));
    assert!(!migrated.needs_to_run_gc(true));
}

#[test]
fn migrate_rejects_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.dict");
    let source = build_source();
    assert!(matches!(
        source.migrate(&path, 9),
        Err(DictError::UnsupportedVersion(9))
    ));
    assert!(!path.exists());
}

#[test]
fn migrated_empty_dictionary_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.dict");
    let source = new_dict_at(FORMAT_VERSION_4);
    let migrated = source.migrate(&path, FORMAT_VERSION_5).unwrap();
    assert_eq!(super::dump_words(&migrated).len(), 0);

    let reopened = Dictionary::open(&path, false).unwrap();
    assert_eq!(reopened.format_version(), FORMAT_VERSION_5);
    assert!(!reopened.is_corrupted());
}
