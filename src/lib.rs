//! Persistent dictionary core for a predictive-text engine.
//!
//! The crate stores a vocabulary with per-word unigram statistics and
//! word-to-word bigram transitions in a single binary file, and answers the
//! queries a suggestion engine needs: exact probability lookup, next-word
//! prediction from a context word, and terminal resolution for tolerant
//! input search. Updatable dictionaries mutate in place and are compacted
//! by an explicit GC flush.

#[cfg(not(target_endian = "little"))]
compile_error!("keydict requires a little-endian platform");

pub mod buffer;
pub mod codec;
pub mod dictionary;
pub mod header;
pub mod probability;
pub mod settings;
pub mod suggest;
pub mod time_keeper;
pub mod trie_map;
pub mod word_store;

mod bigrams;

pub use dictionary::{Dictionary, DictionaryEntry, DictError};
pub use probability::{NOT_A_PROBABILITY, NOT_A_TIMESTAMP};
pub use word_store::{
    BigramProperty, HistoricalInfo, ShortcutProperty, UnigramProperty, WordProperty,
    MAX_WORD_LENGTH, NOT_A_DICT_POS,
};
