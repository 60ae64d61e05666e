//! Dictionary façade: the sole entry point for callers.
//!
//! Owns the header, the word store and the bigram store, and exposes the
//! query/mutation/maintenance surface the host and the suggestion engines
//! consume. Every public entry refreshes the process-wide logical clock so
//! that one call observes one "now".

mod gc;
#[cfg(test)]
mod tests;

use std::cell::Cell;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::bigrams::BigramStore;
use crate::buffer::DictBuffer;
use crate::codec;
use crate::header::DictHeader;
use crate::probability::{combine, NOT_A_PROBABILITY};
use crate::settings::settings;
use crate::suggest::{SuggestEngine, SuggestOptions, SuggestionResults, TapInput, TraverseSession};
use crate::time_keeper;
use crate::trie_map::TrieMap;
use crate::word_store::{
    BigramProperty, HistoricalInfo, ShortcutProperty, UnigramProperty, WordProperty, WordStore,
    NODE_NONE, NOT_A_DICT_POS,
};

/// Unified error type for dictionary open/flush/migration failures.
/// Lookups never error (absence is a sentinel value) and in-memory
/// mutations report failure through their boolean return.
#[derive(Debug, thiserror::Error)]
pub enum DictError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid header (too short or malformed)")]
    InvalidHeader,

    #[error("invalid magic bytes (expected KDIC)")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u16),

    #[error("corrupted body: {0}")]
    Corrupted(&'static str),

    #[error("migration failed: {0}")]
    Migration(&'static str),
}

/// One batched language-model entry: `word1` with its unigram data, plus an
/// optional `word0 → word1` bigram and an optional shortcut for `word1`.
#[derive(Debug, Clone)]
pub struct DictionaryEntry {
    pub word0: Option<Vec<u32>>,
    pub word1: Vec<u32>,
    pub unigram_probability: u8,
    pub bigram_probability: u8,
    pub shortcut_target: Option<Vec<u32>>,
    pub shortcut_probability: u8,
    pub is_not_a_word: bool,
    pub is_blacklisted: bool,
    pub timestamp: u32,
}

// Body preamble: wordCount(4) + nextTerminalId(4) + rootFirstChild(4)
// + bigramCount(4). Four sections follow, each byteLen(4) + garbage(4)
// + bytes, in the order: nodes, terminal map, bigram map, bigram records.
// Version 5 appends a CRC-32 of all preceding body bytes.
const BODY_PREAMBLE_SIZE: usize = 16;
const SECTION_HEADER_SIZE: usize = 8;
const SECTION_COUNT: usize = 4;
const CRC_SIZE: usize = 4;

struct SectionInfo {
    start: usize,
    len: usize,
    garbage: usize,
}

pub struct Dictionary {
    header: DictHeader,
    words: WordStore,
    bigrams: BigramStore,
    typing_engine: Option<Box<dyn SuggestEngine>>,
    gesture_engine: Option<Box<dyn SuggestEngine>>,
    updatable: bool,
    corrupted: Cell<bool>,
    gc_generation: u32,
}

impl Dictionary {
    // --- construction ----------------------------------------------------

    /// An empty updatable dictionary at the given format version.
    pub fn create_on_memory(
        format_version: u16,
        locale: &str,
        attributes: &[(String, String)],
    ) -> Result<Self, DictError> {
        let header = DictHeader::new(format_version, locale, attributes)?;
        Ok(Self::from_header(header))
    }

    fn from_header(header: DictHeader) -> Self {
        Self {
            header,
            words: WordStore::new(),
            bigrams: BigramStore::new(),
            typing_engine: None,
            gesture_engine: None,
            updatable: true,
            corrupted: Cell::new(false),
            gc_generation: 0,
        }
    }

    /// Open a dictionary file. Read-only opens keep the body memory-mapped;
    /// updatable opens copy it into owned buffers.
    pub fn open(path: &Path, updatable: bool) -> Result<Self, DictError> {
        time_keeper::set_current_time();
        if updatable {
            let bytes = fs::read(path)?;
            Self::from_bytes_owned(&bytes)
        } else {
            let file = fs::File::open(path)?;
            // SAFETY: the file is opened read-only; the host owns external
            // serialisation and does not rewrite a mapped dictionary.
            let mmap = Arc::new(unsafe { Mmap::map(&file)? });
            Self::from_mmap(mmap)
        }
    }

    fn from_bytes_owned(bytes: &[u8]) -> Result<Self, DictError> {
        let (header, header_size) = DictHeader::parse(bytes)?;
        let body = &bytes[header_size..];
        let (preamble, sections) = Self::parse_body(&header, body)?;
        let take = |s: &SectionInfo| DictBuffer::from_vec(body[s.start..s.start + s.len].to_vec());
        Self::assemble(header, preamble, &sections, take, true)
    }

    fn from_mmap(mmap: Arc<Mmap>) -> Result<Self, DictError> {
        let (header, header_size) = DictHeader::parse(&mmap)?;
        let body = &mmap[header_size..];
        let (preamble, sections) = Self::parse_body(&header, body)?;
        let take = |s: &SectionInfo| {
            DictBuffer::from_mmap(Arc::clone(&mmap), header_size + s.start, s.len)
                .expect("section ranges were bounds-checked against the body")
        };
        Self::assemble(header, preamble, &sections, take, false)
    }

    fn parse_body(
        header: &DictHeader,
        body: &[u8],
    ) -> Result<([u32; 4], [SectionInfo; SECTION_COUNT]), DictError> {
        let crc_size = if header.format_version() >= crate::header::FORMAT_VERSION_5 {
            CRC_SIZE
        } else {
            0
        };
        if body.len() < BODY_PREAMBLE_SIZE + SECTION_COUNT * SECTION_HEADER_SIZE + crc_size {
            return Err(DictError::Corrupted("body too short"));
        }
        if crc_size > 0 {
            let payload = &body[..body.len() - CRC_SIZE];
            let stored = u32::from_le_bytes(body[body.len() - CRC_SIZE..].try_into().unwrap());
            if crc32fast::hash(payload) != stored {
                return Err(DictError::Corrupted("body checksum mismatch"));
            }
        }

        let read_u32 =
            |pos: usize| u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
        let preamble = [read_u32(0), read_u32(4), read_u32(8), read_u32(12)];

        let mut pos = BODY_PREAMBLE_SIZE;
        let mut sections = Vec::with_capacity(SECTION_COUNT);
        for _ in 0..SECTION_COUNT {
            if pos + SECTION_HEADER_SIZE > body.len() - crc_size {
                return Err(DictError::Corrupted("section header out of range"));
            }
            let len = read_u32(pos) as usize;
            let garbage = read_u32(pos + 4) as usize;
            let start = pos + SECTION_HEADER_SIZE;
            if start + len > body.len() - crc_size {
                return Err(DictError::Corrupted("section extends past the body"));
            }
            sections.push(SectionInfo {
                start,
                len,
                garbage,
            });
            pos = start + len;
        }
        let sections: [SectionInfo; SECTION_COUNT] = sections
            .try_into()
            .map_err(|_| DictError::Corrupted("section table"))?;
        Ok((preamble, sections))
    }

    fn assemble(
        header: DictHeader,
        preamble: [u32; 4],
        sections: &[SectionInfo; SECTION_COUNT],
        take: impl Fn(&SectionInfo) -> DictBuffer,
        updatable: bool,
    ) -> Result<Self, DictError> {
        let [word_count, next_terminal_id, root_first_child, bigram_count] = preamble;
        let nodes = take(&sections[0]);
        let terminal_map = TrieMap::from_buffer(take(&sections[1]), sections[1].garbage)
            .ok_or(DictError::Corrupted("terminal map section"))?;
        let bigram_map = TrieMap::from_buffer(take(&sections[2]), sections[2].garbage)
            .ok_or(DictError::Corrupted("bigram map section"))?;
        let bigram_records = take(&sections[3]);

        if root_first_child != NODE_NONE && root_first_child as usize >= nodes.len() {
            return Err(DictError::Corrupted("root child out of range"));
        }

        let words = WordStore::from_parts(
            nodes,
            terminal_map,
            root_first_child,
            next_terminal_id,
            word_count,
            sections[0].garbage,
        );
        let bigrams = BigramStore::from_parts(
            bigram_map,
            bigram_records,
            bigram_count,
            sections[3].garbage,
        );
        debug!(
            format_version = header.format_version(),
            locale = header.locale(),
            word_count,
            bigram_count,
            "opened dictionary"
        );
        Ok(Self {
            header,
            words,
            bigrams,
            typing_engine: None,
            gesture_engine: None,
            updatable,
            corrupted: Cell::new(false),
            gc_generation: 0,
        })
    }

    /// Serialise header + body in the current (possibly fragmented) state.
    fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.serialize();
        let body_start = out.len();

        out.extend_from_slice(&self.words.word_count().to_le_bytes());
        out.extend_from_slice(&self.words.next_terminal_id().to_le_bytes());
        out.extend_from_slice(&self.words.root_first_child().to_le_bytes());
        out.extend_from_slice(&self.bigrams.bigram_count().to_le_bytes());

        let mut push_section = |out: &mut Vec<u8>, bytes: &[u8], garbage: usize| {
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&(garbage as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        };
        push_section(&mut out, self.words.node_bytes(), self.words.node_garbage_bytes());
        push_section(
            &mut out,
            self.words.terminal_map().as_bytes(),
            self.words.terminal_map().garbage_bytes(),
        );
        push_section(
            &mut out,
            self.bigrams.map().as_bytes(),
            self.bigrams.map().garbage_bytes(),
        );
        push_section(
            &mut out,
            self.bigrams.record_bytes(),
            self.bigrams.record_garbage_bytes(),
        );

        if self.header.format_version() >= crate::header::FORMAT_VERSION_5 {
            let crc = crc32fast::hash(&out[body_start..]);
            out.extend_from_slice(&crc.to_le_bytes());
        }
        out
    }

    /// Register the external suggestion engines.
    pub fn set_suggest_engines(
        &mut self,
        typing: Box<dyn SuggestEngine>,
        gesture: Box<dyn SuggestEngine>,
    ) {
        self.typing_engine = Some(typing);
        self.gesture_engine = Some(gesture);
    }

    // --- queries ---------------------------------------------------------

    pub fn header(&self) -> &DictHeader {
        &self.header
    }

    pub fn format_version(&self) -> u16 {
        self.header.format_version()
    }

    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Delegate a suggestion query to the engine matching the options.
    pub fn get_suggestions(
        &self,
        session: &mut TraverseSession,
        input: &TapInput<'_>,
        prev_word: &[u32],
        options: &SuggestOptions,
        language_weight: f32,
        out: &mut SuggestionResults,
    ) {
        time_keeper::set_current_time();
        session.init(prev_word, options);
        let engine = if options.is_gesture() {
            self.gesture_engine.as_deref()
        } else {
            self.typing_engine.as_deref()
        };
        match engine {
            Some(engine) => engine.get_suggestions(self, session, input, language_weight, out),
            None => debug!(
                is_gesture = options.is_gesture(),
                "no suggestion engine registered"
            ),
        }
    }

    /// Bigram-only expansion from a previous word, scored through the
    /// probability combiner.
    pub fn get_predictions(&self, prev_word: &[u32], out: &mut SuggestionResults) {
        time_keeper::set_current_time();
        if prev_word.is_empty() {
            return;
        }
        let pos = self.words.get_terminal_position_of_word(prev_word, false);
        if pos == NOT_A_DICT_POS {
            return;
        }
        for (target_id, record) in self.bigrams.entries_for(pos as u32) {
            let Some(word) = self.words.word_at_position(target_id as i32) else {
                warn!(target_id, "bigram target does not resolve to a word");
                self.corrupted.set(true);
                continue;
            };
            let unigram = self.words.get_unigram_probability(target_id as i32);
            let score = combine(unigram, record.probability as i32);
            if score != NOT_A_PROBABILITY {
                out.push(&word, score);
            }
        }
    }

    /// Unigram probability of `word`, or `NOT_A_PROBABILITY`.
    pub fn get_probability(&self, word: &[u32]) -> i32 {
        time_keeper::set_current_time();
        let pos = self.words.get_terminal_position_of_word(word, false);
        if pos == NOT_A_DICT_POS {
            return NOT_A_PROBABILITY;
        }
        self.words.get_unigram_probability(pos)
    }

    /// Probability of the bigram `word0 → word1`, or `NOT_A_PROBABILITY`.
    pub fn get_bigram_probability(&self, word0: &[u32], word1: &[u32]) -> i32 {
        time_keeper::set_current_time();
        let pos0 = self.words.get_terminal_position_of_word(word0, false);
        let pos1 = self.words.get_terminal_position_of_word(word1, false);
        if pos0 == NOT_A_DICT_POS || pos1 == NOT_A_DICT_POS {
            return NOT_A_PROBABILITY;
        }
        self.bigrams.get_probability(pos0 as u32, pos1 as u32)
    }

    /// Terminal position of `word`; stable until the next GC.
    pub fn get_terminal_position(&self, word: &[u32], force_lower_case: bool) -> i32 {
        time_keeper::set_current_time();
        self.words
            .get_terminal_position_of_word(word, force_lower_case)
    }

    /// Combine a unigram and a bigram probability under this format.
    pub fn calculate_probability(&self, unigram_probability: i32, bigram_probability: i32) -> i32 {
        combine(unigram_probability, bigram_probability)
    }

    /// Dense read-only export of one word, or `None` when absent.
    pub fn get_word_property(&self, word: &[u32]) -> Option<WordProperty> {
        time_keeper::set_current_time();
        let pos = self.words.get_terminal_position_of_word(word, false);
        if pos == NOT_A_DICT_POS {
            return None;
        }
        let unigram = self.words.unigram_property_at(pos)?;
        let mut bigrams = Vec::new();
        for (target_id, record) in self.bigrams.entries_for(pos as u32) {
            let Some(target) = self.words.word_at_position(target_id as i32) else {
                warn!(target_id, "bigram target does not resolve to a word");
                self.corrupted.set(true);
                continue;
            };
            bigrams.push(BigramProperty {
                target_codepoints: target,
                probability: record.probability,
                historical: record.historical,
            });
        }
        // A deterministic export order regardless of map layout.
        bigrams.sort_by(|a, b| a.target_codepoints.cmp(&b.target_codepoints));
        Some(WordProperty {
            codepoints: word.to_vec(),
            unigram,
            bigrams,
        })
    }

    /// Iterate all words. Pass token `0` to start; a returned token of `0`
    /// means the returned word (if any) was the last one.
    ///
    /// Tokens carry the GC generation: a token issued before a
    /// `flush_with_gc` or migration is rejected and ends the iteration.
    pub fn get_next_word_and_next_token(&self, token: u64) -> (Option<Vec<u32>>, u64) {
        time_keeper::set_current_time();
        let current = if token == 0 {
            self.words.first_terminal()
        } else {
            let generation = (token >> 32) as u32;
            if generation != self.gc_generation {
                warn!(
                    token_generation = generation,
                    current_generation = self.gc_generation,
                    "stale iteration token"
                );
                return (None, 0);
            }
            let cursor = (token & 0xFFFF_FFFF) as u32;
            if cursor == 0 {
                return (None, 0);
            }
            self.words.next_terminal_in_preorder(cursor - 1)
        };
        let Some(offset) = current else {
            return (None, 0);
        };
        let Some(word) = self.words.word_at_node(offset) else {
            self.corrupted.set(true);
            return (None, 0);
        };
        let next_token = match self.words.next_terminal_in_preorder(offset) {
            Some(_) => ((self.gc_generation as u64) << 32) | (offset as u64 + 1),
            None => 0,
        };
        (Some(word), next_token)
    }

    /// Diagnostic counters by name, truncated to `max_len` characters.
    /// Unknown queries yield an empty string.
    pub fn get_property(&self, query: &str, max_len: usize) -> String {
        time_keeper::set_current_time();
        let value = match query {
            "UNIGRAM_COUNT" => self.words.word_count().to_string(),
            "BIGRAM_COUNT" => self.bigrams.bigram_count().to_string(),
            "MAX_UNIGRAM_COUNT" => settings().store.max_unigram_count.to_string(),
            "MAX_BIGRAM_COUNT" => settings().store.max_bigram_count.to_string(),
            _ => String::new(),
        };
        value.chars().take(max_len).collect()
    }

    /// Structural probe: offsets in range, terminals indexed, edges
    /// resolving. GC leaves this false.
    pub fn is_corrupted(&self) -> bool {
        if self.corrupted.get() {
            return true;
        }
        let ok = self.words.validate()
            && self
                .bigrams
                .validate(&|terminal_id| self.words.has_terminal(terminal_id));
        if !ok {
            self.corrupted.set(true);
        }
        !ok
    }

    // --- mutations -------------------------------------------------------

    /// Insert or update a word. False when the dictionary is not updatable,
    /// the word is empty or over-long, or the store is full.
    pub fn add_unigram_word(&mut self, word: &[u32], property: &UnigramProperty) -> bool {
        time_keeper::set_current_time();
        if !self.updatable {
            return false;
        }
        self.words
            .add_unigram_word(word, property, time_keeper::current_time())
    }

    /// Insert or update the bigram `word0 → target`. The source and target
    /// words must already exist.
    pub fn add_bigram_words(&mut self, word0: &[u32], property: &BigramProperty) -> bool {
        time_keeper::set_current_time();
        if !self.updatable {
            return false;
        }
        let pos0 = self.words.get_terminal_position_of_word(word0, false);
        let pos1 = self
            .words
            .get_terminal_position_of_word(&property.target_codepoints, false);
        if pos0 == NOT_A_DICT_POS || pos1 == NOT_A_DICT_POS {
            return false;
        }
        self.bigrams.add(
            pos0 as u32,
            pos1 as u32,
            property.probability,
            &property.historical,
            time_keeper::current_time(),
        )
    }

    /// Remove the bigram `word0 → word1`. Succeeds silently when the edge
    /// (or either word) is absent; false only when not updatable.
    pub fn remove_bigram_words(&mut self, word0: &[u32], word1: &[u32]) -> bool {
        time_keeper::set_current_time();
        if !self.updatable {
            return false;
        }
        let pos0 = self.words.get_terminal_position_of_word(word0, false);
        let pos1 = self.words.get_terminal_position_of_word(word1, false);
        if pos0 != NOT_A_DICT_POS && pos1 != NOT_A_DICT_POS {
            self.bigrams.remove(pos0 as u32, pos1 as u32);
        }
        true
    }

    /// Process batched entries from `start_index` onward. Returns the index
    /// of the next unprocessed entry when GC becomes due mid-batch, or the
    /// entry count on completion.
    ///
    /// The early return does not guarantee the processed prefix is durable;
    /// the caller is expected to `flush_with_gc` and resume.
    pub fn add_multiple_dictionary_entries(
        &mut self,
        entries: &[DictionaryEntry],
        start_index: usize,
    ) -> usize {
        time_keeper::set_current_time();
        if !self.updatable || entries.is_empty() || start_index >= entries.len() {
            return 0;
        }
        for (i, entry) in entries.iter().enumerate().skip(start_index) {
            let mut shortcuts = Vec::new();
            if let Some(target) = &entry.shortcut_target {
                if !target.is_empty() {
                    shortcuts.push(ShortcutProperty {
                        target_codepoints: target.clone(),
                        probability: entry.shortcut_probability,
                    });
                }
            }
            // Count 1: the entry has been input once.
            let unigram = UnigramProperty {
                probability: entry.unigram_probability,
                is_not_a_word: entry.is_not_a_word,
                is_blacklisted: entry.is_blacklisted,
                historical: HistoricalInfo::new(0, 1, entry.timestamp),
                shortcuts,
            };
            if !self.add_unigram_word(&entry.word1, &unigram) {
                warn!(index = i, "failed to add batched unigram");
            }
            if let Some(word0) = &entry.word0 {
                let bigram = BigramProperty {
                    target_codepoints: entry.word1.clone(),
                    probability: entry.bigram_probability,
                    historical: HistoricalInfo::new(0, 1, entry.timestamp),
                };
                if !self.add_bigram_words(word0, &bigram) {
                    warn!(index = i, "failed to add batched bigram");
                }
            }
            if self.needs_to_run_gc(true) {
                return i + 1;
            }
        }
        entries.len()
    }

    // --- maintenance -----------------------------------------------------

    /// Persist the current state in place, tombstones included.
    pub fn flush(&self, path: &Path) -> Result<(), DictError> {
        time_keeper::set_current_time();
        fs::write(path, self.serialize())?;
        Ok(())
    }

    /// Whether in-place updates have fragmented the store enough that the
    /// caller should `flush_with_gc`. With `minds_block_by_gc`, the
    /// threshold is stricter.
    pub fn needs_to_run_gc(&self, minds_block_by_gc: bool) -> bool {
        time_keeper::set_current_time();
        let gc = &settings().gc;
        let garbage = self.words.garbage_bytes() + self.bigrams.garbage_bytes();
        let total = self.words.total_bytes() + self.bigrams.total_bytes();
        if total >= gc.max_body_bytes {
            return true;
        }
        if total == 0 || garbage < gc.min_garbage_bytes {
            return false;
        }
        let threshold = if minds_block_by_gc {
            gc.garbage_ratio_percent_minding_block
        } else {
            gc.garbage_ratio_percent
        };
        garbage * 100 >= total * threshold as usize
    }

    /// Release the handle and its buffers. Dropping does the same; this
    /// exists so call sites can make the hand-back explicit.
    pub fn close(self) {}

    /// Export a word as a lossy string for diagnostics.
    pub fn word_to_string(word: &[u32]) -> String {
        codec::codepoints_to_string(word)
    }
}
