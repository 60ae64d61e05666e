//! Bigram edge store.
//!
//! Edges hang off the TrieMap: the root level is keyed by source terminal
//! id, and each source anchors a child level keyed by target terminal id
//! whose value is the offset of an 8-byte record in the record pool:
//! probability(u8) + level(u8) + count(u16) + timestamp(u32).
//!
//! Record updates rewrite in place (fixed size); removals invalidate the
//! map entry and orphan the record, which counts as garbage until GC.

use crate::buffer::DictBuffer;
use crate::probability::{NOT_A_PROBABILITY, NOT_A_TIMESTAMP};
use crate::settings::settings;
use crate::trie_map::{TrieMap, INVALID_INDEX, ROOT_BITMAP_ENTRY_INDEX};
use crate::word_store::HistoricalInfo;

const RECORD_SIZE: usize = 8;

/// Probability and counters of one edge, keyed externally by target id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigramRecord {
    pub probability: u8,
    pub historical: HistoricalInfo,
}

pub struct BigramStore {
    map: TrieMap,
    records: DictBuffer,
    bigram_count: u32,
    garbage_bytes: usize,
}

impl BigramStore {
    pub fn new() -> Self {
        Self {
            map: TrieMap::new(),
            records: DictBuffer::new(),
            bigram_count: 0,
            garbage_bytes: 0,
        }
    }

    pub fn from_parts(
        map: TrieMap,
        records: DictBuffer,
        bigram_count: u32,
        garbage_bytes: usize,
    ) -> Self {
        Self {
            map,
            records,
            bigram_count,
            garbage_bytes,
        }
    }

    pub fn map(&self) -> &TrieMap {
        &self.map
    }

    pub fn record_bytes(&self) -> &[u8] {
        self.records.as_slice()
    }

    pub fn bigram_count(&self) -> u32 {
        self.bigram_count
    }

    pub fn garbage_bytes(&self) -> usize {
        self.garbage_bytes + self.map.garbage_bytes()
    }

    /// Garbage in the record pool alone, excluding the map.
    pub fn record_garbage_bytes(&self) -> usize {
        self.garbage_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.records.len() + self.map.total_bytes()
    }

    fn read_record(&self, offset: u64) -> Option<BigramRecord> {
        let base = offset as usize;
        Some(BigramRecord {
            probability: self.records.read_u8(base)?,
            historical: HistoricalInfo::new(
                self.records.read_u8(base + 1)?,
                self.records.read_u16(base + 2)?,
                self.records.read_u32(base + 4)?,
            ),
        })
    }

    fn write_record(&mut self, offset: usize, record: &BigramRecord) -> bool {
        self.records.write_u8(offset, record.probability)
            && self.records.write_u8(offset + 1, record.historical.level)
            && self.records.write_u16(offset + 2, record.historical.count)
            && self
                .records
                .write_u32(offset + 4, record.historical.timestamp)
    }

    fn append_record(&mut self, record: &BigramRecord) -> Option<usize> {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0] = record.probability;
        bytes[1] = record.historical.level;
        bytes[2..4].copy_from_slice(&record.historical.count.to_le_bytes());
        bytes[4..8].copy_from_slice(&record.historical.timestamp.to_le_bytes());
        self.records.append(&bytes)
    }

    /// Upsert the edge `source → target`. An unset incoming timestamp is
    /// stamped with `now`; on update the probability is replaced and the
    /// counters merge.
    pub fn add(
        &mut self,
        source_id: u32,
        target_id: u32,
        probability: u8,
        historical: &HistoricalInfo,
        now: u32,
    ) -> bool {
        if !self.records.is_writable() {
            return false;
        }
        let mut incoming = *historical;
        if incoming.timestamp == NOT_A_TIMESTAMP {
            incoming.timestamp = now;
        }

        let level = self.map.get_next_level_bitmap_entry_index_from_root(source_id);
        if level == INVALID_INDEX {
            return false;
        }
        let existing = self.map.get(target_id, level);
        if existing.is_valid {
            let Some(old) = self.read_record(existing.value) else {
                return false;
            };
            let merged = BigramRecord {
                probability,
                historical: old.historical.merged_with(&incoming),
            };
            return self.write_record(existing.value as usize, &merged);
        }

        if self.bigram_count >= settings().store.max_bigram_count {
            return false;
        }
        let record = BigramRecord {
            probability,
            historical: incoming,
        };
        let Some(offset) = self.append_record(&record) else {
            return false;
        };
        if !self.map.put(target_id, offset as u64, level) {
            return false;
        }
        self.bigram_count += 1;
        true
    }

    /// Drop the edge `source → target`. Returns whether an edge existed.
    pub fn remove(&mut self, source_id: u32, target_id: u32) -> bool {
        let level = self
            .map
            .peek_next_level_bitmap_entry_index(source_id, ROOT_BITMAP_ENTRY_INDEX);
        if level == INVALID_INDEX {
            return false;
        }
        if !self.map.remove(target_id, level) {
            return false;
        }
        self.bigram_count = self.bigram_count.saturating_sub(1);
        self.garbage_bytes += RECORD_SIZE;
        true
    }

    /// Probability of the edge, or `NOT_A_PROBABILITY`.
    pub fn get_probability(&self, source_id: u32, target_id: u32) -> i32 {
        match self.get_record(source_id, target_id) {
            Some(record) => record.probability as i32,
            None => NOT_A_PROBABILITY,
        }
    }

    pub fn get_record(&self, source_id: u32, target_id: u32) -> Option<BigramRecord> {
        let level = self
            .map
            .peek_next_level_bitmap_entry_index(source_id, ROOT_BITMAP_ENTRY_INDEX);
        if level == INVALID_INDEX {
            return None;
        }
        let node = self.map.get(target_id, level);
        if !node.is_valid {
            return None;
        }
        self.read_record(node.value)
    }

    /// All live edges out of `source_id` as `(target_id, record)` pairs.
    pub fn entries_for(&self, source_id: u32) -> Vec<(u32, BigramRecord)> {
        let level = self
            .map
            .peek_next_level_bitmap_entry_index(source_id, ROOT_BITMAP_ENTRY_INDEX);
        if level == INVALID_INDEX {
            return Vec::new();
        }
        self.map
            .iter_level(level)
            .into_iter()
            .filter_map(|(target_id, offset)| {
                self.read_record(offset).map(|r| (target_id, r))
            })
            .collect()
    }

    /// Check that every source and target id satisfies `resolves` and every
    /// record offset reads back, and that the live edge count matches.
    pub fn validate(&self, resolves: &dyn Fn(u32) -> bool) -> bool {
        let mut live = 0u32;
        for (source_id, level) in self.map.anchored_keys(ROOT_BITMAP_ENTRY_INDEX) {
            if !resolves(source_id) {
                return false;
            }
            for (target_id, offset) in self.map.iter_level(level) {
                if !resolves(target_id) || self.read_record(offset).is_none() {
                    return false;
                }
                live += 1;
            }
        }
        live == self.bigram_count
    }

    /// Swap the edge map for its compact copy. Used by GC after a fresh
    /// rebuild, when the record pool already has no orphans.
    pub fn with_compacted_map(self) -> Option<Self> {
        Some(Self {
            map: self.map.compacted()?,
            records: self.records,
            bigram_count: self.bigram_count,
            garbage_bytes: self.garbage_bytes,
        })
    }

    /// Every live edge as `((source_id, target_id), record)`.
    pub fn all_edges(&self) -> Vec<((u32, u32), BigramRecord)> {
        let mut out = Vec::new();
        for (source_id, level) in self.map.anchored_keys(ROOT_BITMAP_ENTRY_INDEX) {
            for (target_id, offset) in self.map.iter_level(level) {
                if let Some(record) = self.read_record(offset) {
                    out.push(((source_id, target_id), record));
                }
            }
        }
        out
    }
}

impl Default for BigramStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get() {
        let mut store = BigramStore::new();
        assert!(store.add(1, 2, 180, &HistoricalInfo::default(), 100));
        assert_eq!(store.get_probability(1, 2), 180);
        assert_eq!(store.get_probability(1, 3), NOT_A_PROBABILITY);
        assert_eq!(store.get_probability(2, 1), NOT_A_PROBABILITY);
        assert_eq!(store.bigram_count(), 1);
        // Unset timestamp was stamped.
        assert_eq!(store.get_record(1, 2).unwrap().historical.timestamp, 100);
    }

    #[test]
    fn update_merges_counters() {
        let mut store = BigramStore::new();
        assert!(store.add(1, 2, 100, &HistoricalInfo::new(0, 1, 50), 50));
        assert!(store.add(1, 2, 90, &HistoricalInfo::new(2, 1, 70), 70));
        let record = store.get_record(1, 2).unwrap();
        assert_eq!(record.probability, 90);
        assert_eq!(record.historical.level, 2);
        assert_eq!(record.historical.count, 2);
        assert_eq!(record.historical.timestamp, 70);
        assert_eq!(store.bigram_count(), 1);
    }

    #[test]
    fn remove_is_silent_when_absent() {
        let mut store = BigramStore::new();
        assert!(store.add(1, 2, 100, &HistoricalInfo::default(), 1));
        assert!(store.remove(1, 2));
        assert_eq!(store.get_probability(1, 2), NOT_A_PROBABILITY);
        assert!(!store.remove(1, 2));
        assert!(!store.remove(9, 9));
        assert_eq!(store.bigram_count(), 0);
    }

    #[test]
    fn entries_are_unique_per_target() {
        let mut store = BigramStore::new();
        for target in [5u32, 6, 7] {
            assert!(store.add(1, target, target as u8, &HistoricalInfo::default(), 1));
        }
        assert!(store.add(1, 6, 66, &HistoricalInfo::default(), 2));
        let mut entries = store.entries_for(1);
        entries.sort_by_key(|(t, _)| *t);
        let targets: Vec<u32> = entries.iter().map(|(t, _)| *t).collect();
        assert_eq!(targets, vec![5, 6, 7]);
        assert_eq!(entries[1].1.probability, 66);
    }

    #[test]
    fn separate_sources_do_not_interfere() {
        let mut store = BigramStore::new();
        assert!(store.add(1, 2, 10, &HistoricalInfo::default(), 1));
        assert!(store.add(2, 2, 20, &HistoricalInfo::default(), 1));
        assert_eq!(store.get_probability(1, 2), 10);
        assert_eq!(store.get_probability(2, 2), 20);
        assert!(store.remove(1, 2));
        assert_eq!(store.get_probability(2, 2), 20);
    }
}
