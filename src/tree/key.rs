//! Key encoding
//!
//! Keys are bounded byte strings built from typed segments whose encoding
//! preserves segment-wise ordering under plain byte comparison: integers
//! are sign-flipped big-endian, strings and byte arrays are escaped so the
//! terminator byte sorts below any content byte.

use crate::{PersistitError, Result};
use byteorder::{BigEndian, ByteOrder};

/// Maximum encoded key length.
pub const MAX_KEY_LENGTH: usize = 2047;

const TYPE_INT: u8 = 0x30;
const TYPE_STRING: u8 = 0x40;
const TYPE_BYTES: u8 = 0x50;
const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

/// An encoded key under construction or decoded from a page.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn from_encoded(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_KEY_LENGTH {
            return Err(PersistitError::InvalidKey(format!(
                "encoded key length {} exceeds {}",
                bytes.len(),
                MAX_KEY_LENGTH
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn clear(&mut self) -> &mut Self {
        self.bytes.clear();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn encoded_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn copy_from(&mut self, other: &Key) {
        self.bytes.clear();
        self.bytes.extend_from_slice(&other.bytes);
    }

    fn check_room(&self, additional: usize) -> Result<()> {
        if self.bytes.len() + additional > MAX_KEY_LENGTH {
            return Err(PersistitError::InvalidKey(format!(
                "key would exceed maximum encoded length {}",
                MAX_KEY_LENGTH
            )));
        }
        Ok(())
    }

    /// Append a signed integer segment.
    pub fn append_int(&mut self, value: i64) -> Result<&mut Self> {
        self.check_room(9)?;
        self.bytes.push(TYPE_INT);
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, (value as u64) ^ (1u64 << 63));
        self.bytes.extend_from_slice(&buf);
        Ok(self)
    }

    /// Append a string segment.
    pub fn append_string(&mut self, value: &str) -> Result<&mut Self> {
        self.append_escaped(TYPE_STRING, value.as_bytes())
    }

    /// Append a raw byte-array segment.
    pub fn append_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        self.append_escaped(TYPE_BYTES, value)
    }

    fn append_escaped(&mut self, type_byte: u8, value: &[u8]) -> Result<&mut Self> {
        // worst case every byte escapes to two
        self.check_room(2 + 2 * value.len())?;
        self.bytes.push(type_byte);
        for &byte in value {
            match byte {
                TERMINATOR => {
                    self.bytes.push(ESCAPE);
                    self.bytes.push(0x01);
                }
                ESCAPE => {
                    self.bytes.push(ESCAPE);
                    self.bytes.push(0x02);
                }
                other => self.bytes.push(other),
            }
        }
        self.bytes.push(TERMINATOR);
        if self.bytes.len() > MAX_KEY_LENGTH {
            return Err(PersistitError::InvalidKey(format!(
                "key exceeds maximum encoded length {}",
                MAX_KEY_LENGTH
            )));
        }
        Ok(self)
    }

    pub fn reader(&self) -> KeyReader<'_> {
        KeyReader {
            bytes: &self.bytes,
            position: 0,
        }
    }

    pub(crate) fn truncate(&mut self, length: usize) {
        self.bytes.truncate(length);
    }

    pub(crate) fn extend_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        if self.bytes.len() + bytes.len() > MAX_KEY_LENGTH {
            return Err(PersistitError::InvalidKey(format!(
                "key would exceed maximum encoded length {}",
                MAX_KEY_LENGTH
            )));
        }
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    /// True if this key's encoding begins with `prefix`'s encoding.
    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.bytes.starts_with(&prefix.bytes)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({} bytes)", self.bytes.len())
    }
}

/// Index of the first byte at which two keys differ; the length of the
/// shorter key when one is a prefix of the other.
pub fn first_unique_byte_index(a: &Key, b: &Key) -> usize {
    let limit = a.bytes.len().min(b.bytes.len());
    for i in 0..limit {
        if a.bytes[i] != b.bytes[i] {
            return i;
        }
    }
    limit
}

/// Sequential decoder over a key's segments.
pub struct KeyReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> KeyReader<'a> {
    pub fn has_remaining(&self) -> bool {
        self.position < self.bytes.len()
    }

    pub fn decode_int(&mut self) -> Result<i64> {
        if self.position + 9 > self.bytes.len() || self.bytes[self.position] != TYPE_INT {
            return Err(PersistitError::InvalidKey(
                "expected integer segment".into(),
            ));
        }
        let raw = BigEndian::read_u64(&self.bytes[self.position + 1..]);
        self.position += 9;
        Ok((raw ^ (1u64 << 63)) as i64)
    }

    pub fn decode_string(&mut self) -> Result<String> {
        let bytes = self.decode_escaped(TYPE_STRING)?;
        String::from_utf8(bytes)
            .map_err(|_| PersistitError::InvalidKey("string segment is not UTF-8".into()))
    }

    pub fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        self.decode_escaped(TYPE_BYTES)
    }

    fn decode_escaped(&mut self, type_byte: u8) -> Result<Vec<u8>> {
        if self.position >= self.bytes.len() || self.bytes[self.position] != type_byte {
            return Err(PersistitError::InvalidKey("unexpected segment type".into()));
        }
        let mut out = Vec::new();
        let mut i = self.position + 1;
        loop {
            if i >= self.bytes.len() {
                return Err(PersistitError::InvalidKey(
                    "unterminated key segment".into(),
                ));
            }
            match self.bytes[i] {
                TERMINATOR => {
                    self.position = i + 1;
                    return Ok(out);
                }
                ESCAPE => {
                    if i + 1 >= self.bytes.len() {
                        return Err(PersistitError::InvalidKey(
                            "truncated escape sequence".into(),
                        ));
                    }
                    match self.bytes[i + 1] {
                        0x01 => out.push(TERMINATOR),
                        0x02 => out.push(ESCAPE),
                        _ => {
                            return Err(PersistitError::InvalidKey(
                                "bad escape sequence".into(),
                            ))
                        }
                    }
                    i += 2;
                }
                other => {
                    out.push(other);
                    i += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_segment_round_trip_and_order() {
        let values = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        let mut encoded: Vec<Key> = Vec::new();
        for &v in &values {
            let mut key = Key::new();
            key.append_int(v).unwrap();
            assert_eq!(key.reader().decode_int().unwrap(), v);
            encoded.push(key);
        }
        for window in encoded.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn test_string_segment_round_trip() {
        let mut key = Key::new();
        key.append_string("hello").unwrap();
        key.append_string("").unwrap();
        key.append_int(7).unwrap();
        let mut reader = key.reader();
        assert_eq!(reader.decode_string().unwrap(), "hello");
        assert_eq!(reader.decode_string().unwrap(), "");
        assert_eq!(reader.decode_int().unwrap(), 7);
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_embedded_control_bytes_preserve_order() {
        let mut a = Key::new();
        a.append_bytes(b"a").unwrap();
        let mut b = Key::new();
        b.append_bytes(b"a\x00b").unwrap();
        let mut c = Key::new();
        c.append_bytes(b"a\x01b").unwrap();
        let mut d = Key::new();
        d.append_bytes(b"ab").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert_eq!(b.reader().decode_bytes().unwrap(), b"a\x00b");
        assert_eq!(c.reader().decode_bytes().unwrap(), b"a\x01b");
    }

    #[test]
    fn test_prefix_ordering_across_segments() {
        let mut short = Key::new();
        short.append_string("abc").unwrap();
        let mut long = Key::new();
        long.append_string("abc").unwrap();
        long.append_string("d").unwrap();
        assert!(short < long);
        assert!(long.starts_with(&short));
    }

    #[test]
    fn test_key_length_limit() {
        let mut key = Key::new();
        let chunk = "x".repeat(500);
        key.append_string(&chunk).unwrap();
        key.append_string(&chunk).unwrap();
        key.append_string(&chunk).unwrap();
        // fourth chunk pushes past 2047
        assert!(matches!(
            key.append_string(&chunk),
            Err(PersistitError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_first_unique_byte_index() {
        let mut a = Key::new();
        a.append_string("apple").unwrap();
        let mut b = Key::new();
        b.append_string("apricot").unwrap();
        let e = first_unique_byte_index(&a, &b);
        assert_eq!(&a.as_bytes()[..e], &b.as_bytes()[..e]);
        assert_ne!(a.as_bytes()[e], b.as_bytes()[e]);

        let same = first_unique_byte_index(&a, &a);
        assert_eq!(same, a.encoded_size());
    }
}
