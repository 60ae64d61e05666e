//! Variable-length integer codec and codepoint conversion helpers.
//!
//! Node labels and shortcut targets store codepoint runs as varu32 so that
//! ASCII-heavy vocabularies stay close to one byte per character. Header
//! attributes travel as zero-terminated UTF-8 and are exposed to callers as
//! codepoint arrays.

/// Append `value` as a little-endian base-128 varint (1..=5 bytes).
pub fn write_varu32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a varu32 at `pos`. Returns `(value, bytes_consumed)`, or `None` on
/// a truncated or overlong (>5 byte) encoding.
pub fn read_varu32(data: &[u8], pos: usize) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in data.get(pos..)?.iter().enumerate() {
        if i == 5 {
            return None;
        }
        let bits = (byte & 0x7F) as u32;
        value |= bits.checked_shl(shift)?;
        if byte & 0x80 == 0 {
            // Reject encodings whose top byte overflows 32 bits.
            if shift == 28 && bits > 0x0F {
                return None;
            }
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Byte length of the varu32 encoding of `value`.
pub fn varu32_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x001F_FFFF => 3,
        0x0020_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Convert a codepoint array to a String, replacing invalid scalars with
/// U+FFFD. Used when exporting header attributes and dumped words.
pub fn codepoints_to_string(codepoints: &[u32]) -> String {
    codepoints
        .iter()
        .map(|&cp| char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Convert a string to its codepoint array.
pub fn string_to_codepoints(s: &str) -> Vec<u32> {
    s.chars().map(|c| c as u32).collect()
}

/// Append a zero-terminated UTF-8 string.
pub fn write_zstr(out: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0));
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Read a zero-terminated byte run at `pos`. Returns `(bytes, next_pos)`;
/// `None` if no terminator is found before the end of `data`.
pub fn read_zstr(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = data.get(pos..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some((&rest[..end], pos + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varu32_roundtrip_boundaries() {
        let values = [
            0u32,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x001F_FFFF,
            0x0020_0000,
            0x0FFF_FFFF,
            0x1000_0000,
            u32::MAX,
        ];
        let mut buf = Vec::new();
        for &v in &values {
            write_varu32(&mut buf, v);
        }
        let mut pos = 0;
        for &v in &values {
            let (decoded, used) = read_varu32(&buf, pos).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(used, varu32_len(v));
            pos += used;
        }
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn varu32_truncated() {
        let mut buf = Vec::new();
        write_varu32(&mut buf, 0x4000);
        assert!(read_varu32(&buf[..1], 0).is_none());
        assert!(read_varu32(&buf, buf.len()).is_none());
    }

    #[test]
    fn varu32_overlong_rejected() {
        // Six continuation bytes can never be a valid u32.
        let buf = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(read_varu32(&buf, 0).is_none());
        // A 5-byte encoding whose top byte exceeds 4 bits overflows.
        let buf = [0xFFu8, 0xFF, 0xFF, 0xFF, 0x1F];
        assert!(read_varu32(&buf, 0).is_none());
    }

    #[test]
    fn codepoint_string_roundtrip() {
        let word = "héllo wörld";
        let cps = string_to_codepoints(word);
        assert_eq!(codepoints_to_string(&cps), word);
    }

    #[test]
    fn invalid_codepoint_replaced() {
        let cps = [0x68, 0xD800, 0x69]; // lone surrogate
        assert_eq!(codepoints_to_string(&cps), "h\u{FFFD}i");
    }

    #[test]
    fn zstr_roundtrip() {
        let mut buf = Vec::new();
        write_zstr(&mut buf, "dictionary");
        write_zstr(&mut buf, "");
        let (a, next) = read_zstr(&buf, 0).unwrap();
        assert_eq!(a, b"dictionary");
        let (b, next) = read_zstr(&buf, next).unwrap();
        assert!(b.is_empty());
        assert_eq!(next, buf.len());
        assert!(read_zstr(&buf, next).is_none());
    }
}
