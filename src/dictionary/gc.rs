//! Compaction and cross-version migration.
//!
//! `flush_with_gc` rebuilds both stores by re-inserting every terminal in
//! pre-order into fresh buffers, writes the compact image to a sibling path
//! and renames it over the target, then swaps the rebuilt stores into the
//! live handle. Terminal positions and iteration tokens from before the
//! call are invalid afterwards.
//!
//! Migration runs the same pipeline across a format-version boundary, going
//! through the public token/word-property surface so that it works for any
//! source version.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::bigrams::{BigramRecord, BigramStore};
use crate::time_keeper;
use crate::word_store::WordStore;

use super::{DictError, Dictionary};

impl Dictionary {
    /// Persist a compacted copy to `path` and adopt it in memory. The
    /// write goes to a sibling temporary file first and is renamed into
    /// place.
    pub fn flush_with_gc(&mut self, path: &Path) -> Result<(), DictError> {
        time_keeper::set_current_time();
        let (words, bigrams) = self.rebuild_compact()?;

        let old_words = std::mem::replace(&mut self.words, words);
        let old_bigrams = std::mem::replace(&mut self.bigrams, bigrams);
        let bytes = self.serialize();

        let tmp = path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, path)) {
            // Keep the pre-GC stores on failure so positions stay valid.
            self.words = old_words;
            self.bigrams = old_bigrams;
            return Err(e.into());
        }

        self.gc_generation += 1;
        self.corrupted.set(false);
        debug!(
            path = %path.display(),
            word_count = self.words.word_count(),
            bigram_count = self.bigrams.bigram_count(),
            generation = self.gc_generation,
            "flushed with GC"
        );
        Ok(())
    }

    /// Dump every word in pre-order and rebuild both stores without
    /// tombstones or slack. Output is a pure function of the stored
    /// content, so repeating the rebuild on an already-compact dictionary
    /// reproduces the same bytes.
    fn rebuild_compact(&self) -> Result<(WordStore, BigramStore), DictError> {
        let now = time_keeper::current_time();
        let mut entries = Vec::with_capacity(self.words.word_count() as usize);
        let mut id_map: HashMap<u32, u32> = HashMap::new();

        let mut cursor = self.words.first_terminal();
        while let Some(offset) = cursor {
            let old_id = self
                .words
                .terminal_id_at(offset)
                .ok_or(DictError::Corrupted("terminal without an id"))?;
            let word = self
                .words
                .word_at_node(offset)
                .ok_or(DictError::Corrupted("terminal without a word path"))?;
            let property = self
                .words
                .unigram_property_at(old_id as i32)
                .ok_or(DictError::Corrupted("terminal without a unigram record"))?;
            // Pre-order position becomes the new terminal id.
            id_map.insert(old_id, entries.len() as u32);
            entries.push((word, property));
            cursor = self.words.next_terminal_in_preorder(offset);
        }
        let words = WordStore::build_compact(&entries)
            .ok_or(DictError::Corrupted("compact rebuild failed during GC"))?;

        // Re-key edges and insert them in (source, target) order so the
        // rebuilt map layout is canonical.
        let mut edges: BTreeMap<u32, Vec<(u32, BigramRecord)>> = BTreeMap::new();
        for ((old_source, old_target), record) in self.bigrams.all_edges() {
            let (Some(&source), Some(&target)) =
                (id_map.get(&old_source), id_map.get(&old_target))
            else {
                warn!(old_source, old_target, "dropping dangling bigram edge");
                continue;
            };
            edges.entry(source).or_default().push((target, record));
        }
        let mut bigrams = BigramStore::new();
        for (source, mut targets) in edges {
            targets.sort_by_key(|(target, _)| *target);
            for (target, record) in targets {
                if !bigrams.add(source, target, record.probability, &record.historical, now) {
                    return Err(DictError::Corrupted("bigram re-insertion failed during GC"));
                }
            }
        }
        let bigrams = bigrams
            .with_compacted_map()
            .ok_or(DictError::Corrupted("bigram map compaction failed"))?;
        Ok((words, bigrams))
    }

    /// Rebuild this dictionary at `new_format_version` into `path`,
    /// iterating all entries through the public surface. The source handle
    /// and its file are left untouched; on any insertion failure the
    /// migration aborts.
    pub fn migrate(&self, path: &Path, new_format_version: u16) -> Result<Dictionary, DictError> {
        time_keeper::set_current_time();
        let header = self.header.with_version(new_format_version)?;
        let mut new_dict = Dictionary::from_header(header);

        // Unigram pass.
        let mut token = 0u64;
        loop {
            let (word, next_token) = self.get_next_word_and_next_token(token);
            let Some(word) = word else {
                break;
            };
            let property = self
                .get_word_property(&word)
                .ok_or(DictError::Migration("word disappeared while iterating"))?;
            if new_dict.needs_to_run_gc(true) {
                new_dict.flush_with_gc(path)?;
            }
            if !new_dict.add_unigram_word(&word, &property.unigram) {
                return Err(DictError::Migration("cannot add unigram to the new dict"));
            }
            if next_token == 0 {
                break;
            }
            token = next_token;
        }

        // Bigram pass, after every source and target exists.
        let mut token = 0u64;
        loop {
            let (word, next_token) = self.get_next_word_and_next_token(token);
            let Some(word) = word else {
                break;
            };
            let property = self
                .get_word_property(&word)
                .ok_or(DictError::Migration("word disappeared while iterating"))?;
            if new_dict.needs_to_run_gc(true) {
                new_dict.flush_with_gc(path)?;
            }
            for bigram in &property.bigrams {
                if !new_dict.add_bigram_words(&word, bigram) {
                    return Err(DictError::Migration("cannot add bigram to the new dict"));
                }
            }
            if next_token == 0 {
                break;
            }
            token = next_token;
        }

        new_dict.flush_with_gc(path)?;
        debug!(
            path = %path.display(),
            from_version = self.header.format_version(),
            to_version = new_format_version,
            "migrated dictionary"
        );
        Ok(new_dict)
    }
}
