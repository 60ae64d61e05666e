//! Dictionary file header.
//!
//! Layout, all little-endian:
//! magic(4) + formatVersion(2) + optionFlags(2) + headerSize(4) + attributes.
//! The attribute block is a run of zero-terminated UTF-8 key/value pairs
//! terminated by an empty key; `headerSize` covers the whole header so the
//! body always starts at that offset.

use std::collections::BTreeMap;

use crate::codec;
use crate::dictionary::DictError;

pub const MAGIC: &[u8; 4] = b"KDIC";
pub const FORMAT_VERSION_4: u16 = 4;
pub const FORMAT_VERSION_5: u16 = 5;
const SUPPORTED_VERSIONS: [u16; 2] = [FORMAT_VERSION_4, FORMAT_VERSION_5];

/// Option flag: historical counters are persisted.
pub const FLAG_HAS_HISTORICAL_INFO: u16 = 0x0001;

// magic(4) + version(2) + flags(2) + header_size(4)
const FIXED_HEADER_SIZE: usize = 12;

/// Attribute key under which the locale is stored.
pub const LOCALE_KEY: &str = "locale";

/// Parsed header: format version, option flags and the attribute map.
/// Attributes are kept sorted so serialisation is deterministic.
#[derive(Debug, Clone)]
pub struct DictHeader {
    format_version: u16,
    option_flags: u16,
    attributes: BTreeMap<String, String>,
}

impl DictHeader {
    pub fn new(
        format_version: u16,
        locale: &str,
        attributes: &[(String, String)],
    ) -> Result<Self, DictError> {
        if !SUPPORTED_VERSIONS.contains(&format_version) {
            return Err(DictError::UnsupportedVersion(format_version));
        }
        let mut map: BTreeMap<String, String> = attributes.iter().cloned().collect();
        map.insert(LOCALE_KEY.to_string(), locale.to_string());
        Ok(Self {
            format_version,
            option_flags: FLAG_HAS_HISTORICAL_INFO,
            attributes: map,
        })
    }

    /// Parse a header from the start of `data`. Returns the header and its
    /// size in bytes (the body offset).
    pub fn parse(data: &[u8]) -> Result<(Self, usize), DictError> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(DictError::InvalidHeader);
        }
        if &data[..4] != MAGIC {
            return Err(DictError::InvalidMagic);
        }
        let format_version = u16::from_le_bytes(data[4..6].try_into().unwrap());
        if !SUPPORTED_VERSIONS.contains(&format_version) {
            return Err(DictError::UnsupportedVersion(format_version));
        }
        let option_flags = u16::from_le_bytes(data[6..8].try_into().unwrap());
        let header_size = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        if header_size < FIXED_HEADER_SIZE || header_size > data.len() {
            return Err(DictError::InvalidHeader);
        }

        let block = &data[..header_size];
        let mut attributes = BTreeMap::new();
        let mut pos = FIXED_HEADER_SIZE;
        loop {
            let (key_bytes, next) = codec::read_zstr(block, pos).ok_or(DictError::InvalidHeader)?;
            if key_bytes.is_empty() {
                break;
            }
            let (value_bytes, next) =
                codec::read_zstr(block, next).ok_or(DictError::InvalidHeader)?;
            let key = String::from_utf8_lossy(key_bytes).into_owned();
            // Question-mark policy: a value that is not valid UTF-8 reads
            // back as "?".
            let value = match std::str::from_utf8(value_bytes) {
                Ok(v) => v.to_string(),
                Err(_) => "?".to_string(),
            };
            attributes.insert(key, value);
            pos = next;
        }

        Ok((
            Self {
                format_version,
                option_flags,
                attributes,
            },
            header_size,
        ))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut attr_block = Vec::new();
        for (key, value) in &self.attributes {
            codec::write_zstr(&mut attr_block, key);
            codec::write_zstr(&mut attr_block, value);
        }
        attr_block.push(0); // empty key terminates the block

        let header_size = (FIXED_HEADER_SIZE + attr_block.len()) as u32;
        let mut out = Vec::with_capacity(header_size as usize);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.format_version.to_le_bytes());
        out.extend_from_slice(&self.option_flags.to_le_bytes());
        out.extend_from_slice(&header_size.to_le_bytes());
        out.extend_from_slice(&attr_block);
        out
    }

    pub fn format_version(&self) -> u16 {
        self.format_version
    }

    pub fn option_flags(&self) -> u16 {
        self.option_flags
    }

    pub fn has_historical_info(&self) -> bool {
        self.option_flags & FLAG_HAS_HISTORICAL_INFO != 0
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    pub fn locale(&self) -> &str {
        self.attribute(LOCALE_KEY).unwrap_or("")
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Attribute value as codepoints, or `"?"` when the key is absent.
    pub fn read_value_or_question_mark(&self, key: &str) -> Vec<u32> {
        codec::string_to_codepoints(self.attribute(key).unwrap_or("?"))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The same header re-targeted at another format version (migration).
    pub fn with_version(&self, format_version: u16) -> Result<Self, DictError> {
        if !SUPPORTED_VERSIONS.contains(&format_version) {
            return Err(DictError::UnsupportedVersion(format_version));
        }
        Ok(Self {
            format_version,
            option_flags: self.option_flags,
            attributes: self.attributes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DictHeader {
        DictHeader::new(
            FORMAT_VERSION_4,
            "en_US",
            &[
                ("dictionary".to_string(), "main:en_US".to_string()),
                ("version".to_string(), "42".to_string()),
                ("date".to_string(), "1400000000".to_string()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn roundtrip() {
        let header = sample();
        let bytes = header.serialize();
        let (parsed, size) = DictHeader::parse(&bytes).unwrap();
        assert_eq!(size, bytes.len());
        assert_eq!(parsed.format_version(), FORMAT_VERSION_4);
        assert_eq!(parsed.locale(), "en_US");
        assert_eq!(parsed.attribute("dictionary"), Some("main:en_US"));
        assert_eq!(parsed.attribute("version"), Some("42"));
        assert_eq!(parsed.attribute("date"), Some("1400000000"));
    }

    #[test]
    fn serialization_is_deterministic() {
        assert_eq!(sample().serialize(), sample().serialize());
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample().serialize();
        bytes[0] = b'X';
        assert!(matches!(
            DictHeader::parse(&bytes),
            Err(DictError::InvalidMagic)
        ));
    }

    #[test]
    fn unknown_version() {
        let mut bytes = sample().serialize();
        bytes[4..6].copy_from_slice(&99u16.to_le_bytes());
        assert!(matches!(
            DictHeader::parse(&bytes),
            Err(DictError::UnsupportedVersion(99))
        ));
        assert!(matches!(
            DictHeader::new(3, "en", &[]),
            Err(DictError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn truncated_header() {
        let bytes = sample().serialize();
        assert!(matches!(
            DictHeader::parse(&bytes[..8]),
            Err(DictError::InvalidHeader)
        ));
        // header_size pointing past the buffer
        let mut bytes = sample().serialize();
        let bogus = (bytes.len() + 10) as u32;
        bytes[8..12].copy_from_slice(&bogus.to_le_bytes());
        assert!(matches!(
            DictHeader::parse(&bytes),
            Err(DictError::InvalidHeader)
        ));
    }

    #[test]
    fn question_mark_policy() {
        let header = sample();
        assert_eq!(
            header.read_value_or_question_mark("no_such_key"),
            vec!['?' as u32]
        );

        // A non-UTF-8 value reads back as "?".
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION_4.to_le_bytes());
        bytes.extend_from_slice(&FLAG_HAS_HISTORICAL_INFO.to_le_bytes());
        let mut attr = Vec::new();
        attr.extend_from_slice(b"dictionary\0");
        attr.extend_from_slice(&[0xFF, 0xFE, 0x00]); // invalid UTF-8 value
        attr.push(0);
        let header_size = (12 + attr.len()) as u32;
        bytes.extend_from_slice(&header_size.to_le_bytes());
        bytes.extend_from_slice(&attr);

        let (parsed, _) = DictHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.attribute("dictionary"), Some("?"));
        assert_eq!(
            parsed.read_value_or_question_mark("dictionary"),
            vec!['?' as u32]
        );
    }
}
