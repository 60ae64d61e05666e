//! Mutable patricia-trie word store.
//!
//! Words are paths of codepoint-labelled edges; terminals carry the unigram
//! record and a shortcut list. Nodes live in a [`DictBuffer`] arena and are
//! addressed by byte offset, but the position exposed to callers is the
//! dense *terminal id*: node records may relocate when an interior node
//! becomes a terminal, while ids stay stable until the next GC. A TrieMap
//! level (terminal id → node offset) resolves ids back to nodes.
//!
//! Node record layout:
//! flags(u8) + labelLen(u8) + parent(u32) + nextSibling(u32) + firstChild(u32)
//! + label (labelLen × varu32)
//! + terminal extras when the TERMINAL flag is set:
//!   terminalId(u32) + probability(u8) + level(u8) + count(u16)
//!   + timestamp(u32) + shortcutHead(u32)
//! Shortcut record: next(u32) + probability(u8) + len(u8) + len × varu32.
//!
//! Sibling chains stay sorted by the label's first codepoint, which makes
//! pre-order traversal deterministic for a given word set.


use tracing::warn;

use crate::buffer::DictBuffer;
use crate::codec;
use crate::probability::{NOT_A_PROBABILITY, NOT_A_TIMESTAMP};
use crate::settings::settings;
use crate::trie_map::TrieMap;

/// Longest storable word, in codepoints.
pub const MAX_WORD_LENGTH: usize = 48;

/// Absence sentinel for terminal positions.
pub const NOT_A_DICT_POS: i32 = -1;

/// Null node offset.
pub const NODE_NONE: u32 = u32::MAX;

const FLAG_TERMINAL: u8 = 0x01;
const FLAG_DELETED: u8 = 0x02;
const FLAG_NOT_A_WORD: u8 = 0x04;
const FLAG_BLACKLISTED: u8 = 0x08;

// flags(1) + labelLen(1) + parent(4) + nextSibling(4) + firstChild(4)
const NODE_HEADER_SIZE: usize = 14;
const OFFSET_FLAGS: usize = 0;
const OFFSET_LABEL_LEN: usize = 1;
const OFFSET_PARENT: usize = 2;
const OFFSET_NEXT_SIBLING: usize = 6;
const OFFSET_FIRST_CHILD: usize = 10;

// terminalId(4) + probability(1) + level(1) + count(2) + timestamp(4)
// + shortcutHead(4)
const TERMINAL_EXTRAS_SIZE: usize = 16;

// next(4) + probability(1) + len(1)
const SHORTCUT_HEADER_SIZE: usize = 6;

/// Historical usage counters attached to unigram and bigram records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoricalInfo {
    pub level: u8,
    pub count: u16,
    pub timestamp: u32,
}

impl HistoricalInfo {
    pub fn new(level: u8, count: u16, timestamp: u32) -> Self {
        Self {
            level,
            count,
            timestamp,
        }
    }

    /// Merge an update into an existing record: counts accumulate, the
    /// level and timestamp keep their maxima.
    pub fn merged_with(&self, update: &HistoricalInfo) -> Self {
        Self {
            level: self.level.max(update.level),
            count: self.count.saturating_add(update.count),
            timestamp: self.timestamp.max(update.timestamp),
        }
    }
}

/// An alternative surface form suggested from a source word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutProperty {
    pub target_codepoints: Vec<u32>,
    pub probability: u8,
}

/// Per-terminal unigram record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnigramProperty {
    pub probability: u8,
    pub is_not_a_word: bool,
    pub is_blacklisted: bool,
    pub historical: HistoricalInfo,
    pub shortcuts: Vec<ShortcutProperty>,
}

impl UnigramProperty {
    pub fn new(probability: u8) -> Self {
        Self {
            probability,
            is_not_a_word: false,
            is_blacklisted: false,
            historical: HistoricalInfo::default(),
            shortcuts: Vec::new(),
        }
    }
}

/// Outgoing bigram edge of a word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigramProperty {
    pub target_codepoints: Vec<u32>,
    pub probability: u8,
    pub historical: HistoricalInfo,
}

/// Read-only export of one terminal. Always a dense copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordProperty {
    pub codepoints: Vec<u32>,
    pub unigram: UnigramProperty,
    pub bigrams: Vec<BigramProperty>,
}

impl WordProperty {
    pub fn shortcuts(&self) -> &[ShortcutProperty] {
        &self.unigram.shortcuts
    }
}

struct TerminalView {
    terminal_id: u32,
    probability: u8,
    level: u8,
    count: u16,
    timestamp: u32,
    shortcut_head: u32,
}

struct NodeView {
    offset: u32,
    flags: u8,
    parent: u32,
    next_sibling: u32,
    first_child: u32,
    label: Vec<u32>,
    /// Byte offset of the terminal extras (right after the label), present
    /// even for non-terminals so in-place rewrites know the record end.
    extras_offset: usize,
    terminal: Option<TerminalView>,
}

impl NodeView {
    fn is_terminal(&self) -> bool {
        self.flags & FLAG_TERMINAL != 0
    }

    fn record_size(&self) -> usize {
        self.extras_offset - self.offset as usize
            + if self.is_terminal() {
                TERMINAL_EXTRAS_SIZE
            } else {
                0
            }
    }
}

pub struct WordStore {
    nodes: DictBuffer,
    terminal_map: TrieMap,
    root_first_child: u32,
    next_terminal_id: u32,
    word_count: u32,
    garbage_bytes: usize,
}

impl WordStore {
    pub fn new() -> Self {
        Self {
            nodes: DictBuffer::new(),
            terminal_map: TrieMap::new(),
            root_first_child: NODE_NONE,
            next_terminal_id: 0,
            word_count: 0,
            garbage_bytes: 0,
        }
    }

    pub fn from_parts(
        nodes: DictBuffer,
        terminal_map: TrieMap,
        root_first_child: u32,
        next_terminal_id: u32,
        word_count: u32,
        garbage_bytes: usize,
    ) -> Self {
        Self {
            nodes,
            terminal_map,
            root_first_child,
            next_terminal_id,
            word_count,
            garbage_bytes,
        }
    }

    pub fn node_bytes(&self) -> &[u8] {
        self.nodes.as_slice()
    }

    pub fn terminal_map(&self) -> &TrieMap {
        &self.terminal_map
    }

    pub fn root_first_child(&self) -> u32 {
        self.root_first_child
    }

    pub fn next_terminal_id(&self) -> u32 {
        self.next_terminal_id
    }

    pub fn word_count(&self) -> u32 {
        self.word_count
    }

    pub fn garbage_bytes(&self) -> usize {
        self.garbage_bytes + self.terminal_map.garbage_bytes()
    }

    /// Garbage in the node arena alone, excluding the terminal map.
    pub fn node_garbage_bytes(&self) -> usize {
        self.garbage_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.nodes.len() + self.terminal_map.total_bytes()
    }

    // --- node record IO --------------------------------------------------

    fn read_node(&self, offset: u32) -> Option<NodeView> {
        let base = offset as usize;
        let flags = self.nodes.read_u8(base + OFFSET_FLAGS)?;
        let label_len = self.nodes.read_u8(base + OFFSET_LABEL_LEN)? as usize;
        if label_len == 0 || label_len > MAX_WORD_LENGTH {
            return None;
        }
        let parent = self.nodes.read_u32(base + OFFSET_PARENT)?;
        let next_sibling = self.nodes.read_u32(base + OFFSET_NEXT_SIBLING)?;
        let first_child = self.nodes.read_u32(base + OFFSET_FIRST_CHILD)?;
        let mut label = Vec::with_capacity(label_len);
        let mut pos = base + NODE_HEADER_SIZE;
        for _ in 0..label_len {
            let (cp, used) = self.nodes.read_varu32(pos)?;
            label.push(cp);
            pos += used;
        }
        let terminal = if flags & FLAG_TERMINAL != 0 {
            let terminal_id = self.nodes.read_u32(pos)?;
            let probability = self.nodes.read_u8(pos + 4)?;
            let level = self.nodes.read_u8(pos + 5)?;
            let count = self.nodes.read_u16(pos + 6)?;
            let timestamp = self.nodes.read_u32(pos + 8)?;
            let shortcut_head = self.nodes.read_u32(pos + 12)?;
            Some(TerminalView {
                terminal_id,
                probability,
                level,
                count,
                timestamp,
                shortcut_head,
            })
        } else {
            None
        };
        Some(NodeView {
            offset,
            flags,
            parent,
            next_sibling,
            first_child,
            label,
            extras_offset: pos,
            terminal,
        })
    }

    fn serialize_node(
        flags: u8,
        parent: u32,
        next_sibling: u32,
        first_child: u32,
        label: &[u32],
        terminal: Option<&TerminalView>,
    ) -> Vec<u8> {
        debug_assert!(!label.is_empty() && label.len() <= MAX_WORD_LENGTH);
        let mut out = Vec::with_capacity(NODE_HEADER_SIZE + label.len() + TERMINAL_EXTRAS_SIZE);
        out.push(flags);
        out.push(label.len() as u8);
        out.extend_from_slice(&parent.to_le_bytes());
        out.extend_from_slice(&next_sibling.to_le_bytes());
        out.extend_from_slice(&first_child.to_le_bytes());
        for &cp in label {
            codec::write_varu32(&mut out, cp);
        }
        if let Some(t) = terminal {
            out.extend_from_slice(&t.terminal_id.to_le_bytes());
            out.push(t.probability);
            out.push(t.level);
            out.extend_from_slice(&t.count.to_le_bytes());
            out.extend_from_slice(&t.timestamp.to_le_bytes());
            out.extend_from_slice(&t.shortcut_head.to_le_bytes());
        }
        out
    }

    fn write_parent(&mut self, offset: u32, parent: u32) -> bool {
        self.nodes.write_u32(offset as usize + OFFSET_PARENT, parent)
    }

    fn write_next_sibling(&mut self, offset: u32, next: u32) -> bool {
        self.nodes
            .write_u32(offset as usize + OFFSET_NEXT_SIBLING, next)
    }

    fn write_first_child(&mut self, offset: u32, child: u32) -> bool {
        self.nodes
            .write_u32(offset as usize + OFFSET_FIRST_CHILD, child)
    }

    /// Repoint whatever links to `old` (parent's first child, a sibling, or
    /// the root list head) at `new`.
    fn relink(&mut self, parent: u32, old: u32, new: u32) -> bool {
        let head = if parent == NODE_NONE {
            self.root_first_child
        } else {
            match self.read_node(parent) {
                Some(p) => p.first_child,
                None => return false,
            }
        };
        if head == old {
            return if parent == NODE_NONE {
                self.root_first_child = new;
                true
            } else {
                self.write_first_child(parent, new)
            };
        }
        let mut cur = head;
        while cur != NODE_NONE {
            let Some(node) = self.read_node(cur) else {
                return false;
            };
            if node.next_sibling == old {
                return self.write_next_sibling(cur, new);
            }
            cur = node.next_sibling;
        }
        false
    }

    // --- lookup ----------------------------------------------------------

    /// Terminal position of `codepoints`, or `NOT_A_DICT_POS`. With
    /// `force_lower_case`, a case-folded match is accepted when no exact
    /// match exists.
    pub fn get_terminal_position_of_word(
        &self,
        codepoints: &[u32],
        force_lower_case: bool,
    ) -> i32 {
        if codepoints.is_empty() || codepoints.len() > MAX_WORD_LENGTH {
            return NOT_A_DICT_POS;
        }
        if let Some(id) = self.find_terminal(self.root_first_child, codepoints, false) {
            return id as i32;
        }
        if force_lower_case {
            if let Some(id) = self.find_terminal(self.root_first_child, codepoints, true) {
                return id as i32;
            }
        }
        NOT_A_DICT_POS
    }

    fn find_terminal(&self, head: u32, remaining: &[u32], fold: bool) -> Option<u32> {
        let target = if fold {
            fold_codepoint(remaining[0])
        } else {
            remaining[0]
        };
        let mut cur = head;
        while cur != NODE_NONE {
            let node = self.read_node(cur)?;
            let first = if fold {
                fold_codepoint(node.label[0])
            } else {
                node.label[0]
            };
            if first == target {
                if let Some(id) = self.match_label(&node, remaining, fold) {
                    return Some(id);
                }
                if !fold {
                    // Exact first codepoints are unique among siblings.
                    return None;
                }
                // Folded search may match several siblings; keep scanning.
            } else if !fold && first > target {
                return None;
            }
            cur = node.next_sibling;
        }
        None
    }

    fn match_label(&self, node: &NodeView, remaining: &[u32], fold: bool) -> Option<u32> {
        if remaining.len() < node.label.len() {
            return None;
        }
        let eq = |a: u32, b: u32| {
            if fold {
                fold_codepoint(a) == fold_codepoint(b)
            } else {
                a == b
            }
        };
        if !node
            .label
            .iter()
            .zip(remaining)
            .all(|(&a, &b)| eq(a, b))
        {
            return None;
        }
        let rest = &remaining[node.label.len()..];
        if rest.is_empty() {
            return node.terminal.as_ref().map(|t| t.terminal_id);
        }
        self.find_terminal(node.first_child, rest, fold)
    }

    /// Whether a terminal id resolves to a live node.
    pub fn has_terminal(&self, terminal_id: u32) -> bool {
        self.node_offset_of_terminal(terminal_id).is_some()
    }

    /// Current node offset of a terminal id.
    fn node_offset_of_terminal(&self, terminal_id: u32) -> Option<u32> {
        let node = self.terminal_map.get_root(terminal_id);
        if !node.is_valid {
            return None;
        }
        Some(node.value as u32)
    }

    /// Unigram probability of the terminal at `pos`. Blacklisted and
    /// not-a-word terminals read as absent.
    pub fn get_unigram_probability(&self, pos: i32) -> i32 {
        let Some(node) = self.node_at_position(pos) else {
            return NOT_A_PROBABILITY;
        };
        if node.flags & (FLAG_NOT_A_WORD | FLAG_BLACKLISTED) != 0 {
            return NOT_A_PROBABILITY;
        }
        match node.terminal {
            Some(t) => t.probability as i32,
            None => NOT_A_PROBABILITY,
        }
    }

    fn node_at_position(&self, pos: i32) -> Option<NodeView> {
        if pos < 0 {
            return None;
        }
        let offset = self.node_offset_of_terminal(pos as u32)?;
        self.read_node(offset)
    }

    /// Codepoints of the terminal at `pos`, rebuilt by climbing parents.
    pub fn word_at_position(&self, pos: i32) -> Option<Vec<u32>> {
        let node = self.node_at_position(pos)?;
        let mut runs = vec![node.label];
        let mut parent = node.parent;
        let mut depth = 0;
        while parent != NODE_NONE {
            if depth > MAX_WORD_LENGTH {
                return None;
            }
            let p = self.read_node(parent)?;
            runs.push(p.label.clone());
            parent = p.parent;
            depth += 1;
        }
        let mut word: Vec<u32> = runs.into_iter().rev().flatten().collect();
        if word.len() > MAX_WORD_LENGTH {
            return None;
        }
        word.shrink_to_fit();
        Some(word)
    }

    /// The unigram record of the terminal at `pos`, shortcuts included.
    pub fn unigram_property_at(&self, pos: i32) -> Option<UnigramProperty> {
        let node = self.node_at_position(pos)?;
        let t = node.terminal.as_ref()?;
        Some(UnigramProperty {
            probability: t.probability,
            is_not_a_word: node.flags & FLAG_NOT_A_WORD != 0,
            is_blacklisted: node.flags & FLAG_BLACKLISTED != 0,
            historical: HistoricalInfo::new(t.level, t.count, t.timestamp),
            shortcuts: self.read_shortcuts(t.shortcut_head),
        })
    }

    fn read_shortcuts(&self, head: u32) -> Vec<ShortcutProperty> {
        let mut out = Vec::new();
        let mut cur = head;
        while cur != NODE_NONE {
            let base = cur as usize;
            let Some(next) = self.nodes.read_u32(base) else {
                break;
            };
            let Some(probability) = self.nodes.read_u8(base + 4) else {
                break;
            };
            let Some(len) = self.nodes.read_u8(base + 5) else {
                break;
            };
            let mut target = Vec::with_capacity(len as usize);
            let mut pos = base + SHORTCUT_HEADER_SIZE;
            let mut ok = true;
            for _ in 0..len {
                match self.nodes.read_varu32(pos) {
                    Some((cp, used)) => {
                        target.push(cp);
                        pos += used;
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                break;
            }
            out.push(ShortcutProperty {
                target_codepoints: target,
                probability,
            });
            cur = next;
        }
        out
    }

    // --- insertion -------------------------------------------------------

    /// Insert or update a word. `now` stamps an unset incoming timestamp.
    pub fn add_unigram_word(
        &mut self,
        codepoints: &[u32],
        property: &UnigramProperty,
        now: u32,
    ) -> bool {
        if codepoints.is_empty() || codepoints.len() > MAX_WORD_LENGTH {
            return false;
        }
        if !self.nodes.is_writable() {
            return false;
        }
        let mut effective = property.clone();
        if effective.historical.timestamp == NOT_A_TIMESTAMP {
            effective.historical.timestamp = now;
        }
        self.insert(NODE_NONE, self.root_first_child, codepoints, &effective)
    }

    fn insert(
        &mut self,
        parent: u32,
        head: u32,
        remaining: &[u32],
        property: &UnigramProperty,
    ) -> bool {
        // Locate the sibling sharing the first codepoint, remembering the
        // insertion point in the sorted chain.
        let mut prev = NODE_NONE;
        let mut cur = head;
        let mut matched: Option<NodeView> = None;
        while cur != NODE_NONE {
            let Some(node) = self.read_node(cur) else {
                return false;
            };
            if node.label[0] == remaining[0] {
                matched = Some(node);
                break;
            }
            if node.label[0] > remaining[0] {
                break;
            }
            prev = cur;
            cur = node.next_sibling;
        }

        let Some(node) = matched else {
            // New leaf in the chain between `prev` and `cur`.
            return self
                .append_terminal_leaf(parent, prev, cur, remaining, property)
                .is_some();
        };

        let common = node
            .label
            .iter()
            .zip(remaining)
            .take_while(|(&a, &b)| a == b)
            .count();

        if common == node.label.len() {
            let rest = &remaining[common..];
            if rest.is_empty() {
                return if node.is_terminal() {
                    self.merge_terminal(&node, property)
                } else {
                    self.convert_to_terminal(&node, property)
                };
            }
            let head = node.first_child;
            let offset = node.offset;
            return self.insert(offset, head, rest, property);
        }

        self.split_edge(&node, common, remaining, property)
    }

    fn alloc_terminal_id(&mut self) -> Option<u32> {
        if self.word_count >= settings().store.max_unigram_count {
            return None;
        }
        let id = self.next_terminal_id;
        self.next_terminal_id = self.next_terminal_id.checked_add(1)?;
        Some(id)
    }

    /// Append a fresh terminal node between siblings `prev` and `next`.
    fn append_terminal_leaf(
        &mut self,
        parent: u32,
        prev: u32,
        next: u32,
        label: &[u32],
        property: &UnigramProperty,
    ) -> Option<u32> {
        let id = self.alloc_terminal_id()?;
        let terminal = TerminalView {
            terminal_id: id,
            probability: property.probability,
            level: property.historical.level,
            count: property.historical.count,
            timestamp: property.historical.timestamp,
            shortcut_head: NODE_NONE,
        };
        let flags = FLAG_TERMINAL
            | if property.is_not_a_word {
                FLAG_NOT_A_WORD
            } else {
                0
            }
            | if property.is_blacklisted {
                FLAG_BLACKLISTED
            } else {
                0
            };
        let bytes = Self::serialize_node(flags, parent, next, NODE_NONE, label, Some(&terminal));
        let offset = self.nodes.append(&bytes)? as u32;

        if prev == NODE_NONE {
            if parent == NODE_NONE {
                self.root_first_child = offset;
            } else if !self.write_first_child(parent, offset) {
                return None;
            }
        } else if !self.write_next_sibling(prev, offset) {
            return None;
        }

        if !self.terminal_map.put_root(id, offset as u64) {
            return None;
        }
        self.word_count += 1;

        for shortcut in &property.shortcuts {
            self.append_shortcut(offset, shortcut);
        }
        Some(offset)
    }

    /// Merge an update into an existing terminal: probability and flags are
    /// replaced, counters accumulate, shortcuts merge by target.
    fn merge_terminal(&mut self, node: &NodeView, property: &UnigramProperty) -> bool {
        let t = node.terminal.as_ref().expect("caller checked terminal");
        let merged = HistoricalInfo::new(t.level, t.count, t.timestamp).merged_with(
            &property.historical,
        );
        let flags = (node.flags & !(FLAG_NOT_A_WORD | FLAG_BLACKLISTED))
            | if property.is_not_a_word {
                FLAG_NOT_A_WORD
            } else {
                0
            }
            | if property.is_blacklisted {
                FLAG_BLACKLISTED
            } else {
                0
            };
        let base = node.offset as usize;
        let extras = node.extras_offset;
        if !self.nodes.write_u8(base + OFFSET_FLAGS, flags) {
            return false;
        }
        let ok = self.nodes.write_u8(extras + 4, property.probability)
            && self.nodes.write_u8(extras + 5, merged.level)
            && self.nodes.write_u16(extras + 6, merged.count)
            && self.nodes.write_u32(extras + 8, merged.timestamp);
        if !ok {
            return false;
        }
        for shortcut in &property.shortcuts {
            if !self.merge_shortcut(node.offset, shortcut) {
                return false;
            }
        }
        true
    }

    /// Rebuild an interior node as a terminal at the end of the arena and
    /// tombstone the old record.
    fn convert_to_terminal(&mut self, node: &NodeView, property: &UnigramProperty) -> bool {
        let Some(id) = self.alloc_terminal_id() else {
            return false;
        };
        let terminal = TerminalView {
            terminal_id: id,
            probability: property.probability,
            level: property.historical.level,
            count: property.historical.count,
            timestamp: property.historical.timestamp,
            shortcut_head: NODE_NONE,
        };
        let flags = FLAG_TERMINAL
            | if property.is_not_a_word {
                FLAG_NOT_A_WORD
            } else {
                0
            }
            | if property.is_blacklisted {
                FLAG_BLACKLISTED
            } else {
                0
            };
        let bytes = Self::serialize_node(
            flags,
            node.parent,
            node.next_sibling,
            node.first_child,
            &node.label,
            Some(&terminal),
        );
        let Some(new_offset) = self.nodes.append(&bytes) else {
            return false;
        };
        let new_offset = new_offset as u32;

        // Children follow the relocated record.
        let mut child = node.first_child;
        while child != NODE_NONE {
            let Some(c) = self.read_node(child) else {
                return false;
            };
            if !self.write_parent(child, new_offset) {
                return false;
            }
            child = c.next_sibling;
        }
        if !self.relink(node.parent, node.offset, new_offset) {
            return false;
        }
        let base = node.offset as usize;
        if !self.nodes.write_u8(base + OFFSET_FLAGS, node.flags | FLAG_DELETED) {
            return false;
        }
        self.garbage_bytes += node.record_size();

        if !self.terminal_map.put_root(id, new_offset as u64) {
            return false;
        }
        self.word_count += 1;
        for shortcut in &property.shortcuts {
            self.append_shortcut(new_offset, shortcut);
        }
        true
    }

    /// Split `node`'s edge after `common` matched codepoints and hang the
    /// rest of `remaining` (possibly empty) off the new upper node.
    fn split_edge(
        &mut self,
        node: &NodeView,
        common: usize,
        remaining: &[u32],
        property: &UnigramProperty,
    ) -> bool {
        debug_assert!(common > 0 && common < node.label.len());
        let rest = &remaining[common..];
        let upper_label = &node.label[..common];
        let lower_label = node.label[common..].to_vec();
        let old_size = node.record_size();

        let (upper_flags, upper_terminal, id) = if rest.is_empty() {
            let Some(id) = self.alloc_terminal_id() else {
                return false;
            };
            let flags = FLAG_TERMINAL
                | if property.is_not_a_word {
                    FLAG_NOT_A_WORD
                } else {
                    0
                }
                | if property.is_blacklisted {
                    FLAG_BLACKLISTED
                } else {
                    0
                };
            (
                flags,
                Some(TerminalView {
                    terminal_id: id,
                    probability: property.probability,
                    level: property.historical.level,
                    count: property.historical.count,
                    timestamp: property.historical.timestamp,
                    shortcut_head: NODE_NONE,
                }),
                Some(id),
            )
        } else {
            (0u8, None, None)
        };

        let upper_bytes = Self::serialize_node(
            upper_flags,
            node.parent,
            node.next_sibling,
            node.offset, // provisional: patched below for sibling order
            upper_label,
            upper_terminal.as_ref(),
        );
        let Some(upper_offset) = self.nodes.append(&upper_bytes) else {
            return false;
        };
        let upper_offset = upper_offset as u32;

        if !self.relink(node.parent, node.offset, upper_offset) {
            return false;
        }

        // Shrink the split node in place: suffix label, new parent, no
        // sibling yet. The suffix always re-encodes into fewer bytes.
        let terminal_copy = node.terminal.as_ref().map(|t| TerminalView {
            terminal_id: t.terminal_id,
            probability: t.probability,
            level: t.level,
            count: t.count,
            timestamp: t.timestamp,
            shortcut_head: t.shortcut_head,
        });
        let shrunk = Self::serialize_node(
            node.flags,
            upper_offset,
            NODE_NONE,
            node.first_child,
            &lower_label,
            terminal_copy.as_ref(),
        );
        debug_assert!(shrunk.len() <= old_size);
        if !self.nodes.write_slice(node.offset as usize, &shrunk) {
            return false;
        }
        self.garbage_bytes += old_size - shrunk.len();

        if rest.is_empty() {
            if !self.terminal_map.put_root(
                id.expect("terminal id allocated for word ending at split"),
                upper_offset as u64,
            ) {
                return false;
            }
            self.word_count += 1;
            for shortcut in &property.shortcuts {
                self.append_shortcut(upper_offset, shortcut);
            }
            return true;
        }

        // Two children under the upper node, ordered by first codepoint.
        if rest[0] < lower_label[0] {
            self.append_terminal_leaf(upper_offset, NODE_NONE, node.offset, rest, property)
                .is_some()
        } else {
            if !self.write_first_child(upper_offset, node.offset) {
                return false;
            }
            self.append_terminal_leaf(upper_offset, node.offset, NODE_NONE, rest, property)
                .is_some()
        }
    }

    // --- shortcuts -------------------------------------------------------

    fn append_shortcut(&mut self, node_offset: u32, shortcut: &ShortcutProperty) -> bool {
        if shortcut.target_codepoints.is_empty()
            || shortcut.target_codepoints.len() > MAX_WORD_LENGTH
        {
            return false;
        }
        let mut bytes = Vec::with_capacity(
            SHORTCUT_HEADER_SIZE + shortcut.target_codepoints.len() * 2,
        );
        bytes.extend_from_slice(&NODE_NONE.to_le_bytes());
        bytes.push(shortcut.probability);
        bytes.push(shortcut.target_codepoints.len() as u8);
        for &cp in &shortcut.target_codepoints {
            codec::write_varu32(&mut bytes, cp);
        }
        let Some(record) = self.nodes.append(&bytes) else {
            return false;
        };
        let record = record as u32;

        // Link at the tail to preserve insertion order.
        let Some(node) = self.read_node(node_offset) else {
            return false;
        };
        let Some(t) = node.terminal.as_ref() else {
            return false;
        };
        if t.shortcut_head == NODE_NONE {
            return self.nodes.write_u32(node.extras_offset + 12, record);
        }
        let mut cur = t.shortcut_head;
        loop {
            let Some(next) = self.nodes.read_u32(cur as usize) else {
                return false;
            };
            if next == NODE_NONE {
                return self.nodes.write_u32(cur as usize, record);
            }
            cur = next;
        }
    }

    /// Update the probability of an existing shortcut target in place, or
    /// append a new record.
    fn merge_shortcut(&mut self, node_offset: u32, shortcut: &ShortcutProperty) -> bool {
        let Some(node) = self.read_node(node_offset) else {
            return false;
        };
        let Some(t) = node.terminal.as_ref() else {
            return false;
        };
        let mut cur = t.shortcut_head;
        while cur != NODE_NONE {
            let base = cur as usize;
            let Some(next) = self.nodes.read_u32(base) else {
                return false;
            };
            let Some(len) = self.nodes.read_u8(base + 5) else {
                return false;
            };
            let mut target = Vec::with_capacity(len as usize);
            let mut pos = base + SHORTCUT_HEADER_SIZE;
            for _ in 0..len {
                let Some((cp, used)) = self.nodes.read_varu32(pos) else {
                    return false;
                };
                target.push(cp);
                pos += used;
            }
            if target == shortcut.target_codepoints {
                return self.nodes.write_u8(base + 4, shortcut.probability);
            }
            cur = next;
        }
        self.append_shortcut(node_offset, shortcut)
    }

    // --- traversal -------------------------------------------------------

    /// Offset of the first terminal in pre-order, if any.
    pub fn first_terminal(&self) -> Option<u32> {
        let head = self.root_first_child;
        if head == NODE_NONE {
            return None;
        }
        let node = self.read_node(head)?;
        if node.is_terminal() {
            return Some(head);
        }
        self.next_terminal_in_preorder(head)
    }

    /// Offset of the terminal following the node at `offset` in pre-order.
    pub fn next_terminal_in_preorder(&self, offset: u32) -> Option<u32> {
        let mut cur = self.next_node_in_preorder(offset)?;
        let mut guard = 0usize;
        loop {
            let node = self.read_node(cur)?;
            if node.is_terminal() {
                return Some(cur);
            }
            cur = self.next_node_in_preorder(cur)?;
            guard += 1;
            if guard > self.nodes.len() {
                warn!("cycle detected in node graph during traversal");
                return None;
            }
        }
    }

    fn next_node_in_preorder(&self, offset: u32) -> Option<u32> {
        let node = self.read_node(offset)?;
        if node.first_child != NODE_NONE {
            return Some(node.first_child);
        }
        if node.next_sibling != NODE_NONE {
            return Some(node.next_sibling);
        }
        let mut parent = node.parent;
        let mut guard = 0usize;
        while parent != NODE_NONE {
            let p = self.read_node(parent)?;
            if p.next_sibling != NODE_NONE {
                return Some(p.next_sibling);
            }
            parent = p.parent;
            guard += 1;
            if guard > MAX_WORD_LENGTH * 2 {
                return None;
            }
        }
        None
    }

    /// Terminal id stored at a node offset returned by the traversal API.
    pub fn terminal_id_at(&self, offset: u32) -> Option<u32> {
        self.read_node(offset)?.terminal.as_ref().map(|t| t.terminal_id)
    }

    /// Word spelled by the path ending at `offset`.
    pub fn word_at_node(&self, offset: u32) -> Option<Vec<u32>> {
        let id = self.terminal_id_at(offset)?;
        self.word_at_position(id as i32)
    }

    // --- compact build ---------------------------------------------------

    /// Build a store with no tombstones and no slack bytes from entries
    /// sorted by codepoints (the pre-order dump of an existing store).
    /// Terminal ids are assigned in entry order.
    pub fn build_compact(entries: &[(Vec<u32>, UnigramProperty)]) -> Option<WordStore> {
        let mut builder = CompactBuilder::default();
        for (id, (word, property)) in entries.iter().enumerate() {
            if word.is_empty() || word.len() > MAX_WORD_LENGTH {
                return None;
            }
            builder.insert(word, id as u32, property);
        }
        builder.finish(entries.len() as u32)
    }

    // --- validation ------------------------------------------------------

    /// Structural scan: every reachable offset parses, every terminal is
    /// indexed at its current offset, and the terminal count matches.
    pub fn validate(&self) -> bool {
        let mut terminal_count = 0u32;
        let mut visited = 0usize;
        let mut stack = Vec::new();
        if self.root_first_child != NODE_NONE {
            stack.push((self.root_first_child, 0usize));
        }
        while let Some((offset, depth)) = stack.pop() {
            visited += 1;
            if visited > self.nodes.len() / NODE_HEADER_SIZE + 1 {
                warn!("node graph has more reachable records than the arena can hold");
                return false;
            }
            let Some(node) = self.read_node(offset) else {
                warn!(offset, "unreadable node record");
                return false;
            };
            if node.flags & FLAG_DELETED != 0 {
                warn!(offset, "tombstoned node is still linked");
                return false;
            }
            if depth + node.label.len() > MAX_WORD_LENGTH {
                warn!(offset, "path exceeds the word length bound");
                return false;
            }
            if let Some(t) = node.terminal.as_ref() {
                terminal_count += 1;
                match self.node_offset_of_terminal(t.terminal_id) {
                    Some(mapped) if mapped == offset => {}
                    _ => {
                        warn!(
                            terminal_id = t.terminal_id,
                            offset, "terminal is not indexed at its record"
                        );
                        return false;
                    }
                }
            } else if node.first_child == NODE_NONE {
                warn!(offset, "interior node without children");
                return false;
            }
            if node.next_sibling != NODE_NONE {
                stack.push((node.next_sibling, depth));
            }
            if node.first_child != NODE_NONE {
                stack.push((node.first_child, depth + node.label.len()));
            }
        }
        terminal_count == self.word_count
    }
}

impl Default for WordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory trie used to lay out a compact node arena in one pass.
#[derive(Default)]
struct CompactBuilder {
    nodes: Vec<BuildNode>,
    roots: Vec<usize>,
}

struct BuildNode {
    label: Vec<u32>,
    children: Vec<usize>,
    terminal: Option<(u32, UnigramProperty)>,
}

impl CompactBuilder {
    fn child_list(&mut self, parent: Option<usize>) -> &mut Vec<usize> {
        match parent {
            None => &mut self.roots,
            Some(p) => &mut self.nodes[p].children,
        }
    }

    fn push_node(&mut self, label: Vec<u32>, terminal: Option<(u32, UnigramProperty)>) -> usize {
        self.nodes.push(BuildNode {
            label,
            children: Vec::new(),
            terminal,
        });
        self.nodes.len() - 1
    }

    fn insert(&mut self, word: &[u32], id: u32, property: &UnigramProperty) {
        let mut parent: Option<usize> = None;
        let mut consumed = 0usize;
        loop {
            let remaining = &word[consumed..];
            let list = match parent {
                None => &self.roots,
                Some(p) => &self.nodes[p].children,
            };
            let slot = list
                .iter()
                .position(|&c| self.nodes[c].label[0] >= remaining[0]);
            let matched = match slot {
                Some(i) if self.nodes[list[i]].label[0] == remaining[0] => Some(list[i]),
                _ => None,
            };

            let Some(child) = matched else {
                let index = self.push_node(remaining.to_vec(), Some((id, property.clone())));
                let list = self.child_list(parent);
                match slot {
                    Some(i) => list.insert(i, index),
                    None => list.push(index),
                }
                return;
            };

            let common = self.nodes[child]
                .label
                .iter()
                .zip(remaining)
                .take_while(|(&a, &b)| a == b)
                .count();

            if common < self.nodes[child].label.len() {
                // Split: `child` keeps the suffix under a new upper node.
                let suffix = self.nodes[child].label.split_off(common);
                let upper_label = std::mem::replace(&mut self.nodes[child].label, suffix);
                let upper = self.push_node(upper_label, None);
                self.nodes[upper].children.push(child);
                let list = self.child_list(parent);
                let position = list
                    .iter()
                    .position(|&c| c == child)
                    .expect("split child is in its parent list");
                list[position] = upper;
                if remaining.len() == common {
                    self.nodes[upper].terminal = Some((id, property.clone()));
                    return;
                }
                let leaf = self.push_node(remaining[common..].to_vec(), Some((id, property.clone())));
                if self.nodes[leaf].label[0] < self.nodes[child].label[0] {
                    self.nodes[upper].children.insert(0, leaf);
                } else {
                    self.nodes[upper].children.push(leaf);
                }
                return;
            }

            consumed += common;
            if consumed == word.len() {
                self.nodes[child].terminal = Some((id, property.clone()));
                return;
            }
            parent = Some(child);
        }
    }

    /// Lay the tree out in pre-order with exact offsets and no slack.
    fn finish(self, word_count: u32) -> Option<WordStore> {
        // Pre-order sequence.
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            order.push(index);
            for &child in self.nodes[index].children.iter().rev() {
                stack.push(child);
            }
        }

        // Node offsets, then shortcut record offsets after all nodes.
        let mut offsets = vec![0u32; self.nodes.len()];
        let mut pos = 0usize;
        for &index in &order {
            let node = &self.nodes[index];
            offsets[index] = pos as u32;
            pos += NODE_HEADER_SIZE
                + node.label.iter().map(|&cp| codec::varu32_len(cp)).sum::<usize>()
                + if node.terminal.is_some() {
                    TERMINAL_EXTRAS_SIZE
                } else {
                    0
                };
        }
        let mut shortcut_heads = vec![NODE_NONE; self.nodes.len()];
        for &index in &order {
            if let Some((_, property)) = &self.nodes[index].terminal {
                if !property.shortcuts.is_empty() {
                    shortcut_heads[index] = pos as u32;
                }
                for shortcut in &property.shortcuts {
                    pos += SHORTCUT_HEADER_SIZE
                        + shortcut
                            .target_codepoints
                            .iter()
                            .map(|&cp| codec::varu32_len(cp))
                            .sum::<usize>();
                }
            }
        }

        // Write pass.
        let mut bytes = Vec::with_capacity(pos);
        let sibling_after = |parent_children: &[usize], index: usize| -> u32 {
            match parent_children.iter().position(|&c| c == index) {
                Some(i) if i + 1 < parent_children.len() => offsets[parent_children[i + 1]],
                _ => NODE_NONE,
            }
        };
        let mut parents = vec![NODE_NONE; self.nodes.len()];
        let mut siblings = vec![NODE_NONE; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                parents[child] = offsets[index];
            }
        }
        for node in &self.nodes {
            for &child in &node.children {
                siblings[child] = sibling_after(&node.children, child);
            }
        }
        for &root in &self.roots {
            siblings[root] = sibling_after(&self.roots, root);
        }

        let mut terminal_map = TrieMap::new();
        for &index in &order {
            let node = &self.nodes[index];
            let terminal = node.terminal.as_ref().map(|(id, property)| TerminalView {
                terminal_id: *id,
                probability: property.probability,
                level: property.historical.level,
                count: property.historical.count,
                timestamp: property.historical.timestamp,
                shortcut_head: shortcut_heads[index],
            });
            let flags = match node.terminal.as_ref() {
                Some((_, property)) => {
                    FLAG_TERMINAL
                        | if property.is_not_a_word {
                            FLAG_NOT_A_WORD
                        } else {
                            0
                        }
                        | if property.is_blacklisted {
                            FLAG_BLACKLISTED
                        } else {
                            0
                        }
                }
                None => 0,
            };
            debug_assert_eq!(bytes.len(), offsets[index] as usize);
            bytes.extend_from_slice(&WordStore::serialize_node(
                flags,
                parents[index],
                siblings[index],
                node.children.first().map_or(NODE_NONE, |&c| offsets[c]),
                &node.label,
                terminal.as_ref(),
            ));
            if let Some((id, _)) = node.terminal {
                if !terminal_map.put_root(id, offsets[index] as u64) {
                    return None;
                }
            }
        }
        for &index in &order {
            if let Some((_, property)) = &self.nodes[index].terminal {
                for (i, shortcut) in property.shortcuts.iter().enumerate() {
                    let record_size = SHORTCUT_HEADER_SIZE
                        + shortcut
                            .target_codepoints
                            .iter()
                            .map(|&cp| codec::varu32_len(cp))
                            .sum::<usize>();
                    // Records of one terminal are consecutive.
                    let next = if i + 1 < property.shortcuts.len() {
                        (bytes.len() + record_size) as u32
                    } else {
                        NODE_NONE
                    };
                    bytes.extend_from_slice(&next.to_le_bytes());
                    bytes.push(shortcut.probability);
                    bytes.push(shortcut.target_codepoints.len() as u8);
                    for &cp in &shortcut.target_codepoints {
                        codec::write_varu32(&mut bytes, cp);
                    }
                }
            }
        }
        debug_assert_eq!(bytes.len(), pos);

        let root_first_child = self.roots.first().map_or(NODE_NONE, |&r| offsets[r]);
        Some(WordStore::from_parts(
            DictBuffer::from_vec(bytes),
            terminal_map.compacted()?,
            root_first_child,
            word_count,
            word_count,
            0,
        ))
    }
}

/// One-to-one case folding; multi-codepoint expansions keep the original.
fn fold_codepoint(cp: u32) -> u32 {
    let Some(c) = char::from_u32(cp) else {
        return cp;
    };
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l as u32,
        _ => cp,
    }
}
