//! Range-delete tombstones
//!
//! An AntiValue marks the upper endpoint of a transactional range delete.
//! Rather than storing the full upper-bound key it stores `(elision,
//! suffix)`: the number of leading bytes shared with the anchoring
//! lower-bound key, and the bytes that follow. Reconstruction splices the
//! suffix onto the anchor.

use crate::tree::key::{first_unique_byte_index, Key, MAX_KEY_LENGTH};
use crate::{PersistitError, Result};
use byteorder::{BigEndian, ByteOrder};

/// Encode the upper endpoint `key2` of a range delete anchored at `key1`.
pub fn put_anti_value(key1: &Key, key2: &Key) -> Result<Vec<u8>> {
    if key2 < key1 {
        return Err(PersistitError::IllegalArgument(
            "range upper bound precedes lower bound".into(),
        ));
    }
    let elision = first_unique_byte_index(key1, key2);
    let suffix = &key2.as_bytes()[elision..];
    let mut out = Vec::with_capacity(2 + suffix.len());
    let mut prefix = [0u8; 2];
    BigEndian::write_u16(&mut prefix, elision as u16);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(suffix);
    Ok(out)
}

/// Decode an AntiValue into its `(elision, suffix)` parts.
pub fn decode_anti_value(bytes: &[u8]) -> Result<(usize, &[u8])> {
    if bytes.len() < 2 {
        return Err(PersistitError::CorruptVolume(
            "truncated anti-value".into(),
        ));
    }
    let elision = BigEndian::read_u16(bytes) as usize;
    Ok((elision, &bytes[2..]))
}

/// Rebuild the upper endpoint in `spare`, which must currently hold the
/// anchoring key (the lower bound at apply time).
pub fn fix_up_keys(spare: &mut Key, anti_value: &[u8]) -> Result<()> {
    let (elision, suffix) = decode_anti_value(anti_value)?;
    if spare.encoded_size() < elision {
        return Err(PersistitError::InvalidKey(format!(
            "anchor key has {} bytes, anti-value elides {}",
            spare.encoded_size(),
            elision
        )));
    }
    if elision + suffix.len() > MAX_KEY_LENGTH {
        return Err(PersistitError::InvalidKey(format!(
            "reconstructed key length {} exceeds {}",
            elision + suffix.len(),
            MAX_KEY_LENGTH
        )));
    }
    spare.truncate(elision);
    spare.extend_encoded(suffix)?;
    Ok(())
}
