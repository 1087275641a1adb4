//! Composite key encoding and the versioned value envelope.
//!
//! Keys are the UTF-8 bytes of their parts joined by a single space, so a
//! part may never contain a space. Values are bincode payloads behind a
//! small checksummed header:
//!
//! ```text
//! [format u8 = 1][reserved u8][type version u16 LE][payload len u32 LE][crc32c u32 LE][payload]
//! ```
//!
//! Bytes after the payload are ignored; fixed-length tables pad records.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ResourceError, ResourceResult};

/// Separator between key parts.
pub const KEY_SEPARATOR: char = ' ';

/// Envelope format understood by this build.
pub const ENVELOPE_FORMAT: u8 = 1;

/// Envelope header size in bytes.
pub const ENVELOPE_SIZE: usize = 12;

/// Check that `part` can appear in a key.
pub fn validate_part(part: &str) -> ResourceResult<()> {
    if part.contains(KEY_SEPARATOR) {
        return Err(ResourceError::validation(format!(
            "key part {:?} contains the separator {:?}",
            part, KEY_SEPARATOR
        )));
    }
    Ok(())
}

/// Encode a key tuple of exactly `arity` parts.
pub fn encode_key<S: AsRef<str>>(parts: &[S], arity: usize) -> ResourceResult<Vec<u8>> {
    if parts.len() != arity {
        return Err(ResourceError::validation(format!(
            "expected {} key parts, got {}",
            arity,
            parts.len()
        )));
    }
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.as_ref().len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        validate_part(part)?;
        if i > 0 {
            key.push(KEY_SEPARATOR as u8);
        }
        key.extend_from_slice(part.as_bytes());
    }
    Ok(key)
}

/// Encode the leading parts of a key, followed by the separator, for
/// prefix scans.
pub(crate) fn encode_prefix<S: AsRef<str>>(parts: &[S]) -> ResourceResult<Vec<u8>> {
    let mut prefix = encode_key(parts, parts.len())?;
    prefix.push(KEY_SEPARATOR as u8);
    Ok(prefix)
}

/// Split an encoded key back into its parts.
pub fn decode_key(bytes: &[u8]) -> ResourceResult<Vec<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ResourceError::codec(format!("key is not UTF-8: {}", e)))?;
    Ok(text.split(KEY_SEPARATOR).map(str::to_string).collect())
}

/// Serialize `value` into an envelope tagged with `version`.
pub fn serialize<V: Serialize>(value: &V, version: u16) -> ResourceResult<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|e| ResourceError::codec(format!("serialize failed: {}", e)))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ResourceError::codec(format!("value of {} bytes is too large", payload.len())))?;

    let mut buf = Vec::with_capacity(ENVELOPE_SIZE + payload.len());
    buf.push(ENVELOPE_FORMAT);
    buf.push(0);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize an envelope written by [`serialize`] with the same `version`.
pub fn deserialize<V: DeserializeOwned>(bytes: &[u8], version: u16) -> ResourceResult<V> {
    if bytes.len() < ENVELOPE_SIZE {
        return Err(ResourceError::codec(format!(
            "value of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    if bytes[0] != ENVELOPE_FORMAT {
        return Err(ResourceError::codec(format!("unknown value format {}", bytes[0])));
    }
    let stored_version = u16::from_le_bytes([bytes[2], bytes[3]]);
    if stored_version != version {
        return Err(ResourceError::codec(format!(
            "value version {} does not match expected {}",
            stored_version, version
        )));
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

    let payload = bytes
        .get(ENVELOPE_SIZE..ENVELOPE_SIZE + len)
        .ok_or_else(|| ResourceError::codec(format!("value truncated: payload of {} bytes missing", len)))?;
    let actual = crc32c::crc32c(payload);
    if actual != checksum {
        return Err(ResourceError::codec(format!(
            "value checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
            checksum, actual
        )));
    }

    bincode::deserialize(payload).map_err(|e| ResourceError::codec(format!("deserialize failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let parts = ["alice", "2024-01", "x"];
        let key = encode_key(&parts, 3).unwrap();
        assert_eq!(key, b"alice 2024-01 x".to_vec());
        assert_eq!(decode_key(&key).unwrap(), parts);
    }

    #[test]
    fn test_single_part_and_empty_part() {
        assert_eq!(decode_key(&encode_key(&["1"], 1).unwrap()).unwrap(), vec!["1"]);
        let key = encode_key(&["", "b"], 2).unwrap();
        assert_eq!(decode_key(&key).unwrap(), vec!["", "b"]);
    }

    #[test]
    fn test_wrong_arity_rejected() {
        assert!(matches!(encode_key(&["a"], 2), Err(ResourceError::Validation(_))));
        assert!(matches!(encode_key(&["a", "b", "c"], 2), Err(ResourceError::Validation(_))));
    }

    #[test]
    fn test_separator_in_part_rejected() {
        assert!(matches!(encode_key(&["a b", "c"], 2), Err(ResourceError::Validation(_))));
    }

    #[test]
    fn test_non_utf8_key() {
        assert!(matches!(decode_key(&[0xff, 0xfe]), Err(ResourceError::Codec(_))));
    }

    #[test]
    fn test_prefix_ends_with_separator() {
        assert_eq!(encode_prefix(&["a"]).unwrap(), b"a ".to_vec());
    }

    #[test]
    fn test_value_envelope_ignores_padding() {
        let mut bytes = serialize(&vec!["x".to_string(), "y".to_string()], 3).unwrap();
        bytes.resize(bytes.len() + 20, b' ');
        let value: Vec<String> = deserialize(&bytes, 3).unwrap();
        assert_eq!(value, vec!["x", "y"]);
    }

    #[test]
    fn test_version_mismatch() {
        let bytes = serialize(&42u64, 1).unwrap();
        assert!(matches!(deserialize::<u64>(&bytes, 2), Err(ResourceError::Codec(_))));
    }

    #[test]
    fn test_corrupted_payload() {
        let mut bytes = serialize(&"hello".to_string(), 1).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(deserialize::<String>(&bytes, 1), Err(ResourceError::Codec(_))));
        assert!(matches!(deserialize::<String>(&bytes[..4], 1), Err(ResourceError::Codec(_))));
    }
}
