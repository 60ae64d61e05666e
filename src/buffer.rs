//! Random-access byte region backing the dictionary stores.
//!
//! A region is either owned (updatable dictionaries, growable through the
//! append API) or a window of a shared read-only memory map (fast open
//! path). All reads and writes are bounds-checked; writes to a mapped
//! region fail rather than panic.

use std::sync::Arc;

use memmap2::Mmap;

/// A bounds-checked byte region, owned or mmap-backed.
pub enum DictBuffer {
    Owned(Vec<u8>),
    Mapped {
        mmap: Arc<Mmap>,
        start: usize,
        len: usize,
    },
}

impl DictBuffer {
    pub fn new() -> Self {
        DictBuffer::Owned(Vec::new())
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        DictBuffer::Owned(data)
    }

    /// A read-only window `[start, start + len)` of a shared map.
    /// Returns `None` if the range falls outside the map.
    pub fn from_mmap(mmap: Arc<Mmap>, start: usize, len: usize) -> Option<Self> {
        if start.checked_add(len)? > mmap.len() {
            return None;
        }
        Some(DictBuffer::Mapped { mmap, start, len })
    }

    pub fn len(&self) -> usize {
        match self {
            DictBuffer::Owned(v) => v.len(),
            DictBuffer::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, DictBuffer::Owned(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            DictBuffer::Owned(v) => v,
            DictBuffer::Mapped { mmap, start, len } => &mmap[*start..*start + *len],
        }
    }

    /// Copy into an owned buffer (used when promoting a mapped dictionary
    /// to an updatable one).
    pub fn to_owned_buffer(&self) -> DictBuffer {
        DictBuffer::Owned(self.as_slice().to_vec())
    }

    pub fn read_u8(&self, pos: usize) -> Option<u8> {
        self.as_slice().get(pos).copied()
    }

    pub fn read_u16(&self, pos: usize) -> Option<u16> {
        let b = self.as_slice().get(pos..pos + 2)?;
        Some(u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32(&self, pos: usize) -> Option<u32> {
        let b = self.as_slice().get(pos..pos + 4)?;
        Some(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&self, pos: usize) -> Option<u64> {
        let b = self.as_slice().get(pos..pos + 8)?;
        Some(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_varu32(&self, pos: usize) -> Option<(u32, usize)> {
        crate::codec::read_varu32(self.as_slice(), pos)
    }

    fn write_bytes(&mut self, pos: usize, bytes: &[u8]) -> bool {
        match self {
            DictBuffer::Owned(v) => match v.get_mut(pos..pos + bytes.len()) {
                Some(dst) => {
                    dst.copy_from_slice(bytes);
                    true
                }
                None => false,
            },
            DictBuffer::Mapped { .. } => false,
        }
    }

    pub fn write_u8(&mut self, pos: usize, value: u8) -> bool {
        self.write_bytes(pos, &[value])
    }

    pub fn write_u16(&mut self, pos: usize, value: u16) -> bool {
        self.write_bytes(pos, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, pos: usize, value: u32) -> bool {
        self.write_bytes(pos, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, pos: usize, value: u64) -> bool {
        self.write_bytes(pos, &value.to_le_bytes())
    }

    /// Overwrite `bytes.len()` bytes at `pos`. The region must already
    /// cover the range; the append region grows only through `append`.
    pub fn write_slice(&mut self, pos: usize, bytes: &[u8]) -> bool {
        self.write_bytes(pos, bytes)
    }

    /// Append to the end of the region and return the offset the bytes
    /// landed at. Fails on mapped regions.
    pub fn append(&mut self, bytes: &[u8]) -> Option<usize> {
        match self {
            DictBuffer::Owned(v) => {
                let pos = v.len();
                v.extend_from_slice(bytes);
                Some(pos)
            }
            DictBuffer::Mapped { .. } => None,
        }
    }
}

impl Default for DictBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use memmap2::Mmap;

    use super::DictBuffer;

    #[test]
    fn bounded_reads_and_writes() {
        let mut buf = DictBuffer::from_vec(vec![0u8; 8]);
        assert!(buf.write_u32(0, 0xDEAD_BEEF));
        assert!(buf.write_u32(4, 7));
        assert_eq!(buf.read_u32(0), Some(0xDEAD_BEEF));
        assert_eq!(buf.read_u32(4), Some(7));
        assert_eq!(buf.read_u32(5), None);
        assert!(!buf.write_u32(5, 1));
        assert_eq!(buf.read_u64(0), Some(7u64 << 32 | 0xDEAD_BEEF));
    }

    #[test]
    fn append_returns_offset() {
        let mut buf = DictBuffer::new();
        assert_eq!(buf.append(&[1, 2, 3]), Some(0));
        assert_eq!(buf.append(&[4]), Some(3));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.read_u8(3), Some(4));
    }

    #[test]
    fn mapped_region_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");
        fs::write(&path, [9u8, 8, 7, 6, 5]).unwrap();
        let file = fs::File::open(&path).unwrap();
        // SAFETY: the file is opened read-only and unmodified while mapped.
        let mmap = Arc::new(unsafe { Mmap::map(&file).unwrap() });

        let mut buf = DictBuffer::from_mmap(Arc::clone(&mmap), 1, 3).unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.read_u8(0), Some(8));
        assert_eq!(buf.read_u8(3), None);
        assert!(!buf.is_writable());
        assert!(!buf.write_u8(0, 1));
        assert!(buf.append(&[1]).is_none());

        assert!(DictBuffer::from_mmap(mmap, 4, 3).is_none());

        let owned = buf.to_owned_buffer();
        assert_eq!(owned.as_slice(), &[8, 7, 6]);
        assert!(owned.is_writable());
    }
}
