//! Bitmap-indexed hash trie mapping 32-bit keys to values of up to 36 bits.
//!
//! The map lives in a [`DictBuffer`] as an array of 12-byte entries and is
//! the index substrate for both the word store (terminal id → node offset)
//! and the bigram store (source id → target set). Each entry in a level's
//! child array is either a terminal for one key or a nested bitmap that
//! resolves a hash collision five bits deeper. A terminal may additionally
//! point at a *next level*: an independent child map rooted at its own
//! bitmap entry, which is how callers attach nested maps to a key.
//!
//! Updates are append-plus-relocate: growing a child array copies it to the
//! end of the buffer and abandons the old run, which is counted as garbage
//! until the owner compacts the store.
//!
//! Entry layout (little-endian):
//! - `field0: u32`: occupancy bitmap (bitmap entry) or the key (terminal)
//! - `field1: u64`: bitmap entry has bit63 set and bits 0..40 as the
//!   first-child index; terminal packs bit62 `HAS_VALUE`, bit61
//!   `HAS_NEXT_LEVEL`, bits 36..60 next-level index, bits 0..36 value

#[cfg(test)]
mod tests;

use crate::buffer::DictBuffer;

/// Entry bytes: field0(4) + field1(8).
pub const ENTRY_SIZE: usize = 12;

/// Largest storable value.
pub const MAX_VALUE: u64 = (1 << 36) - 1;

/// Returned by level allocation on failure.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Entry index of the root level's bitmap entry.
pub const ROOT_BITMAP_ENTRY_INDEX: u32 = 0;

const KIND_BITMAP: u64 = 1 << 63;
const HAS_VALUE: u64 = 1 << 62;
const HAS_NEXT_LEVEL: u64 = 1 << 61;
const VALUE_MASK: u64 = MAX_VALUE;
const NEXT_LEVEL_SHIFT: u32 = 36;
const NEXT_LEVEL_MASK: u64 = (1 << 24) - 1;
const FIRST_CHILD_MASK: u64 = (1 << 40) - 1;

/// Five key bits per step; the 32-bit hash is exhausted after seven steps.
const BITS_PER_LEVEL: u32 = 5;
const LABEL_MASK: u32 = 0x1F;
const MAX_DEPTH: u32 = 6;

/// Result of a lookup. An unset key yields `is_valid == false`; a key that
/// only anchors a child level yields `is_valid == false` with a live
/// `next_level_bitmap_entry_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub is_valid: bool,
    pub value: u64,
    pub next_level_bitmap_entry_index: u32,
}

impl Node {
    fn invalid() -> Self {
        Node {
            is_valid: false,
            value: 0,
            next_level_bitmap_entry_index: INVALID_INDEX,
        }
    }
}

/// Bijective scramble so that dense keys spread over the bitmap labels.
fn scramble(key: u32) -> u32 {
    let mut h = key;
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846c_a68b);
    h ^= h >> 16;
    h
}

fn label(hash: u32, depth: u32) -> u32 {
    (hash >> (BITS_PER_LEVEL * depth)) & LABEL_MASK
}

pub struct TrieMap {
    buffer: DictBuffer,
    garbage_bytes: usize,
}

impl TrieMap {
    /// An empty map: a single root bitmap entry with no children.
    pub fn new() -> Self {
        let mut map = TrieMap {
            buffer: DictBuffer::new(),
            garbage_bytes: 0,
        };
        map.append_entry(0, KIND_BITMAP)
            .expect("append to a fresh owned buffer cannot fail");
        map
    }

    /// Adopt an existing entry region (body section). Fails if the region
    /// is not a whole number of entries or lacks a root bitmap entry.
    pub fn from_buffer(buffer: DictBuffer, garbage_bytes: usize) -> Option<Self> {
        if buffer.len() < ENTRY_SIZE || buffer.len() % ENTRY_SIZE != 0 {
            return None;
        }
        let map = TrieMap {
            buffer,
            garbage_bytes,
        };
        let (_, f1) = map.read_entry(ROOT_BITMAP_ENTRY_INDEX)?;
        if f1 & KIND_BITMAP == 0 {
            return None;
        }
        Some(map)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn total_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn garbage_bytes(&self) -> usize {
        self.garbage_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.buffer.len() / ENTRY_SIZE
    }

    // --- entry accessors -------------------------------------------------

    fn read_entry(&self, index: u32) -> Option<(u32, u64)> {
        let pos = index as usize * ENTRY_SIZE;
        Some((self.buffer.read_u32(pos)?, self.buffer.read_u64(pos + 4)?))
    }

    fn write_entry(&mut self, index: u32, field0: u32, field1: u64) -> bool {
        let pos = index as usize * ENTRY_SIZE;
        self.buffer.write_u32(pos, field0) && self.buffer.write_u64(pos + 4, field1)
    }

    fn append_entry(&mut self, field0: u32, field1: u64) -> Option<u32> {
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes[..4].copy_from_slice(&field0.to_le_bytes());
        bytes[4..].copy_from_slice(&field1.to_le_bytes());
        let pos = self.buffer.append(&bytes)?;
        Some((pos / ENTRY_SIZE) as u32)
    }

    fn terminal_field1(value: Option<u64>, next_level: Option<u32>) -> u64 {
        let mut f1 = 0;
        if let Some(v) = value {
            f1 |= HAS_VALUE | (v & VALUE_MASK);
        }
        if let Some(n) = next_level {
            f1 |= HAS_NEXT_LEVEL | ((n as u64 & NEXT_LEVEL_MASK) << NEXT_LEVEL_SHIFT);
        }
        f1
    }

    fn node_from_terminal(field1: u64) -> Node {
        Node {
            is_valid: field1 & HAS_VALUE != 0,
            value: field1 & VALUE_MASK,
            next_level_bitmap_entry_index: if field1 & HAS_NEXT_LEVEL != 0 {
                ((field1 >> NEXT_LEVEL_SHIFT) & NEXT_LEVEL_MASK) as u32
            } else {
                INVALID_INDEX
            },
        }
    }

    // --- public surface --------------------------------------------------

    /// Upsert into the root level. False only on structural failure
    /// (out-of-range value, read-only buffer, exhausted index space).
    pub fn put_root(&mut self, key: u32, value: u64) -> bool {
        self.put(key, value, ROOT_BITMAP_ENTRY_INDEX)
    }

    pub fn get_root(&self, key: u32) -> Node {
        self.get(key, ROOT_BITMAP_ENTRY_INDEX)
    }

    /// Upsert into the level rooted at `bitmap_entry_index`.
    pub fn put(&mut self, key: u32, value: u64, bitmap_entry_index: u32) -> bool {
        if value > MAX_VALUE {
            return false;
        }
        let Some(entry_index) = self.locate_or_insert(key, bitmap_entry_index) else {
            return false;
        };
        let Some((f0, f1)) = self.read_entry(entry_index) else {
            return false;
        };
        debug_assert_eq!(f0, key);
        let next = if f1 & HAS_NEXT_LEVEL != 0 {
            Some(((f1 >> NEXT_LEVEL_SHIFT) & NEXT_LEVEL_MASK) as u32)
        } else {
            None
        };
        self.write_entry(entry_index, key, Self::terminal_field1(Some(value), next))
    }

    pub fn get(&self, key: u32, bitmap_entry_index: u32) -> Node {
        match self.locate(key, bitmap_entry_index) {
            Some(entry_index) => match self.read_entry(entry_index) {
                Some((_, f1)) => Self::node_from_terminal(f1),
                None => Node::invalid(),
            },
            None => Node::invalid(),
        }
    }

    /// The child level anchored at `key` within the root level, allocating
    /// it if absent. `INVALID_INDEX` on allocation failure.
    pub fn get_next_level_bitmap_entry_index_from_root(&mut self, key: u32) -> u32 {
        self.get_next_level_bitmap_entry_index(key, ROOT_BITMAP_ENTRY_INDEX)
    }

    /// The child level anchored at `key` within the given level, allocating
    /// it if absent. `INVALID_INDEX` on allocation failure.
    pub fn get_next_level_bitmap_entry_index(&mut self, key: u32, bitmap_entry_index: u32) -> u32 {
        let Some(entry_index) = self.locate_or_insert(key, bitmap_entry_index) else {
            return INVALID_INDEX;
        };
        let Some((_, f1)) = self.read_entry(entry_index) else {
            return INVALID_INDEX;
        };
        if f1 & HAS_NEXT_LEVEL != 0 {
            return ((f1 >> NEXT_LEVEL_SHIFT) & NEXT_LEVEL_MASK) as u32;
        }
        // Allocate an empty level root. It is referenced through a 24-bit
        // link, so refuse indices past that.
        let Some(level_index) = self.append_entry(0, KIND_BITMAP) else {
            return INVALID_INDEX;
        };
        if level_index as u64 > NEXT_LEVEL_MASK {
            return INVALID_INDEX;
        }
        let value = if f1 & HAS_VALUE != 0 {
            Some(f1 & VALUE_MASK)
        } else {
            None
        };
        let Some((key_read, _)) = self.read_entry(entry_index) else {
            return INVALID_INDEX;
        };
        if !self.write_entry(
            entry_index,
            key_read,
            Self::terminal_field1(value, Some(level_index)),
        ) {
            return INVALID_INDEX;
        }
        level_index
    }

    /// Like `get_next_level_bitmap_entry_index` but without allocating.
    pub fn peek_next_level_bitmap_entry_index(&self, key: u32, bitmap_entry_index: u32) -> u32 {
        self.get(key, bitmap_entry_index).next_level_bitmap_entry_index
    }

    /// Clear the value stored for `key` in the given level. Returns true if
    /// a value was present. The entry itself stays behind as a tombstone.
    pub fn remove(&mut self, key: u32, bitmap_entry_index: u32) -> bool {
        let Some(entry_index) = self.locate(key, bitmap_entry_index) else {
            return false;
        };
        let Some((f0, f1)) = self.read_entry(entry_index) else {
            return false;
        };
        if f1 & HAS_VALUE == 0 {
            return false;
        }
        let next = if f1 & HAS_NEXT_LEVEL != 0 {
            Some(((f1 >> NEXT_LEVEL_SHIFT) & NEXT_LEVEL_MASK) as u32)
        } else {
            None
        };
        if !self.write_entry(entry_index, f0, Self::terminal_field1(None, next)) {
            return false;
        }
        if next.is_none() {
            self.garbage_bytes += ENTRY_SIZE;
        }
        true
    }

    /// All `(key, value)` pairs of the level, in scrambled-hash order.
    /// The order is a pure function of the stored key set.
    pub fn iter_level(&self, bitmap_entry_index: u32) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        self.collect_level(bitmap_entry_index, &mut out);
        out
    }

    /// A compact copy: live entries only, arrays laid out in canonical
    /// depth-first order. Maps built by inserting the same key set compact
    /// to identical bytes regardless of insertion order.
    pub fn compacted(&self) -> Option<TrieMap> {
        let mut fresh = TrieMap {
            buffer: DictBuffer::new(),
            garbage_bytes: 0,
        };
        fresh.copy_level(self, ROOT_BITMAP_ENTRY_INDEX)?;
        Some(fresh)
    }

    /// Append a copy of the level rooted at `old_index` in `old` and return
    /// the new root's entry index.
    fn copy_level(&mut self, old: &TrieMap, old_index: u32) -> Option<u32> {
        let (bitmap, f1) = old.read_entry(old_index)?;
        if f1 & KIND_BITMAP == 0 {
            return None;
        }
        let new_index = self.append_entry(bitmap, KIND_BITMAP)?;
        self.copy_children(old, old_index, new_index)?;
        Some(new_index)
    }

    /// Copy the child array of `old_index` behind the already-written
    /// bitmap entry at `new_index`, dropping tombstoned terminals.
    fn copy_children(&mut self, old: &TrieMap, old_index: u32, new_index: u32) -> Option<()> {
        let (old_bitmap, old_f1) = old.read_entry(old_index)?;
        let old_base = (old_f1 & FIRST_CHILD_MASK) as u32;

        let mut kept: Vec<(u32, u32, u32, u64)> = Vec::new(); // label, old child, f0, f1
        let mut slot = 0u32;
        for label in 0..u32::BITS {
            if old_bitmap & (1 << label) == 0 {
                continue;
            }
            let old_child = old_base + slot;
            slot += 1;
            let (f0, f1) = old.read_entry(old_child)?;
            let dead = f1 & KIND_BITMAP == 0 && f1 & (HAS_VALUE | HAS_NEXT_LEVEL) == 0;
            if !dead {
                kept.push((label, old_child, f0, f1));
            }
        }

        let new_bitmap = kept.iter().fold(0u32, |acc, &(l, ..)| acc | (1 << l));
        let new_base = self.entry_count() as u32;
        if new_base as u64 > FIRST_CHILD_MASK {
            return None;
        }
        for &(_, _, f0, f1) in &kept {
            self.append_entry(f0, f1)?;
        }
        if !self.write_entry(new_index, new_bitmap, KIND_BITMAP | new_base as u64) {
            return None;
        }

        for (i, &(_, old_child, f0, f1)) in kept.iter().enumerate() {
            let new_child = new_base + i as u32;
            if f1 & KIND_BITMAP != 0 {
                self.copy_children(old, old_child, new_child)?;
            } else if f1 & HAS_NEXT_LEVEL != 0 {
                let old_next = ((f1 >> NEXT_LEVEL_SHIFT) & NEXT_LEVEL_MASK) as u32;
                let new_next = self.copy_level(old, old_next)?;
                if new_next as u64 > NEXT_LEVEL_MASK {
                    return None;
                }
                let patched = (f1 & !(NEXT_LEVEL_MASK << NEXT_LEVEL_SHIFT))
                    | ((new_next as u64) << NEXT_LEVEL_SHIFT);
                if !self.write_entry(new_child, f0, patched) {
                    return None;
                }
            }
        }
        Some(())
    }

    /// All keys of the level that anchor a child level, paired with the
    /// child level's bitmap entry index. Includes keys without a value.
    pub fn anchored_keys(&self, bitmap_entry_index: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        self.collect_anchors(bitmap_entry_index, &mut out);
        out
    }

    fn collect_anchors(&self, bitmap_index: u32, out: &mut Vec<(u32, u32)>) {
        let Some((bitmap, f1)) = self.read_entry(bitmap_index) else {
            return;
        };
        if f1 & KIND_BITMAP == 0 {
            return;
        }
        let base = (f1 & FIRST_CHILD_MASK) as u32;
        for slot in 0..bitmap.count_ones() {
            let child = base + slot;
            let Some((f0, child_f1)) = self.read_entry(child) else {
                return;
            };
            if child_f1 & KIND_BITMAP != 0 {
                self.collect_anchors(child, out);
            } else if child_f1 & HAS_NEXT_LEVEL != 0 {
                out.push((
                    f0,
                    ((child_f1 >> NEXT_LEVEL_SHIFT) & NEXT_LEVEL_MASK) as u32,
                ));
            }
        }
    }

    fn collect_level(&self, bitmap_index: u32, out: &mut Vec<(u32, u64)>) {
        let Some((bitmap, f1)) = self.read_entry(bitmap_index) else {
            return;
        };
        if f1 & KIND_BITMAP == 0 {
            return;
        }
        let base = (f1 & FIRST_CHILD_MASK) as u32;
        for slot in 0..bitmap.count_ones() {
            let child = base + slot;
            let Some((f0, child_f1)) = self.read_entry(child) else {
                return;
            };
            if child_f1 & KIND_BITMAP != 0 {
                self.collect_level(child, out);
            } else if child_f1 & HAS_VALUE != 0 {
                out.push((f0, child_f1 & VALUE_MASK));
            }
        }
    }

    // --- walk helpers ----------------------------------------------------

    /// Entry index of the terminal for `key`, or `None` if unset.
    fn locate(&self, key: u32, bitmap_entry_index: u32) -> Option<u32> {
        let hash = scramble(key);
        let mut depth = 0;
        let mut bitmap_index = bitmap_entry_index;
        loop {
            let (bitmap, f1) = self.read_entry(bitmap_index)?;
            if f1 & KIND_BITMAP == 0 {
                return None;
            }
            let l = label(hash, depth);
            if bitmap & (1 << l) == 0 {
                return None;
            }
            let base = (f1 & FIRST_CHILD_MASK) as u32;
            let child = base + (bitmap & ((1 << l) - 1)).count_ones();
            let (child_f0, child_f1) = self.read_entry(child)?;
            if child_f1 & KIND_BITMAP != 0 {
                if depth >= MAX_DEPTH {
                    return None;
                }
                bitmap_index = child;
                depth += 1;
                continue;
            }
            return if child_f0 == key { Some(child) } else { None };
        }
    }

    /// Entry index of the terminal for `key`, inserting an empty terminal
    /// (no value, no next level) when the key is absent.
    fn locate_or_insert(&mut self, key: u32, bitmap_entry_index: u32) -> Option<u32> {
        if !self.buffer.is_writable() {
            return self.locate(key, bitmap_entry_index);
        }
        let hash = scramble(key);
        let mut depth = 0;
        let mut bitmap_index = bitmap_entry_index;
        loop {
            let (bitmap, f1) = self.read_entry(bitmap_index)?;
            if f1 & KIND_BITMAP == 0 {
                return None;
            }
            let l = label(hash, depth);
            let base = (f1 & FIRST_CHILD_MASK) as u32;
            if bitmap & (1 << l) == 0 {
                return self.insert_into_array(bitmap_index, bitmap, base, l, key);
            }
            let child = base + (bitmap & ((1 << l) - 1)).count_ones();
            let (child_f0, child_f1) = self.read_entry(child)?;
            if child_f1 & KIND_BITMAP != 0 {
                if depth >= MAX_DEPTH {
                    return None;
                }
                bitmap_index = child;
                depth += 1;
                continue;
            }
            if child_f0 == key {
                return Some(child);
            }
            return self.split_collision(child, child_f0, child_f1, key, depth);
        }
    }

    /// Grow the child array of `bitmap_index` by one slot for label `l`,
    /// relocating the array to the append region.
    fn insert_into_array(
        &mut self,
        bitmap_index: u32,
        bitmap: u32,
        base: u32,
        l: u32,
        key: u32,
    ) -> Option<u32> {
        let old_count = bitmap.count_ones();
        let slot = (bitmap & ((1 << l) - 1)).count_ones() as usize;

        let mut moved = Vec::with_capacity(old_count as usize);
        for i in 0..old_count {
            moved.push(self.read_entry(base + i)?);
        }

        let new_base = self.entry_count() as u32;
        if new_base as u64 > FIRST_CHILD_MASK {
            return None;
        }
        for &(f0, f1) in &moved[..slot] {
            self.append_entry(f0, f1)?;
        }
        let inserted_at = self.append_entry(key, 0)?;
        for &(f0, f1) in &moved[slot..] {
            self.append_entry(f0, f1)?;
        }

        if !self.write_entry(
            bitmap_index,
            bitmap | (1 << l),
            KIND_BITMAP | new_base as u64,
        ) {
            return None;
        }
        self.garbage_bytes += old_count as usize * ENTRY_SIZE;
        Some(inserted_at)
    }

    /// Replace the terminal at `slot_index` (for `other_key`) with a chain
    /// of bitmap entries deep enough to separate it from `key`, and return
    /// the new terminal entry for `key`.
    fn split_collision(
        &mut self,
        slot_index: u32,
        other_key: u32,
        other_f1: u64,
        key: u32,
        depth: u32,
    ) -> Option<u32> {
        let h_new = scramble(key);
        let h_other = scramble(other_key);

        let mut d = depth + 1;
        while d <= MAX_DEPTH && label(h_new, d) == label(h_other, d) {
            d += 1;
        }
        if d > MAX_DEPTH {
            // Distinct keys always diverge within the hash width; reaching
            // here means the stored structure is inconsistent.
            return None;
        }

        // Deepest array: the two diverging terminals, ordered by label.
        let (l_new, l_other) = (label(h_new, d), label(h_other, d));
        let mut base = self.entry_count() as u32;
        let new_entry_index;
        if l_new < l_other {
            new_entry_index = self.append_entry(key, 0)?;
            self.append_entry(other_key, other_f1)?;
        } else {
            self.append_entry(other_key, other_f1)?;
            new_entry_index = self.append_entry(key, 0)?;
        }
        let mut bitmap = (1u32 << l_new) | (1 << l_other);

        // Wrap single-entry bitmap levels back up to just below `depth`.
        for dd in (depth + 1..d).rev() {
            if base as u64 > FIRST_CHILD_MASK {
                return None;
            }
            let wrapped = self.append_entry(bitmap, KIND_BITMAP | base as u64)?;
            base = wrapped;
            bitmap = 1 << label(h_new, dd);
        }

        if base as u64 > FIRST_CHILD_MASK {
            return None;
        }
        if !self.write_entry(slot_index, bitmap, KIND_BITMAP | base as u64) {
            return None;
        }
        Some(new_entry_index)
    }
}

impl Default for TrieMap {
    fn default() -> Self {
        Self::new()
    }
}
