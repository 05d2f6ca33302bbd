//! Key paths for multi-store membership proofs.
//!
//! A key path names one key per proof layer, outermost first, as a
//! `/`-prefixed sequence of URL-escaped segments: `/store/abc%2Fdef`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::proof::ProofError;

/// Escape everything outside unreserved characters, same set as URL path
/// segments.
const SEGMENT_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Builder for escaped key paths.
#[derive(Debug, Clone, Default)]
pub struct KeyPath {
    segments: Vec<Vec<u8>>,
}

impl KeyPath {
    pub fn new() -> Self {
        KeyPath::default()
    }

    /// Append one key, outermost first.
    pub fn append(mut self, key: &[u8]) -> Self {
        self.segments.push(key.to_vec());
        self
    }

    /// Render the escaped `/`-prefixed path.
    pub fn to_path(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match std::str::from_utf8(segment) {
                Ok(s) => out.push_str(&utf8_percent_encode(s, SEGMENT_ESCAPE).to_string()),
                // Non-UTF-8 keys are hex-escaped byte by byte.
                Err(_) => {
                    for byte in segment {
                        out.push_str(&format!("%{byte:02X}"));
                    }
                }
            }
        }
        out
    }
}

/// Parse an escaped key path into raw key segments, outermost first.
///
/// Rejected shapes: missing leading `/`, empty segments (`//`), a trailing
/// `/`, and an entirely empty path.
pub fn parse_key_path(path: &str) -> Result<Vec<Vec<u8>>, ProofError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| ProofError::MalformedKeyPath(format!("{path:?} must start with '/'")))?;
    if rest.is_empty() {
        return Err(ProofError::MalformedKeyPath("empty key path".to_string()));
    }

    let mut keys = Vec::new();
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(ProofError::MalformedKeyPath(format!(
                "empty segment in {path:?}"
            )));
        }
        let decoded = percent_decode_str(segment).collect::<Vec<u8>>();
        keys.push(decoded);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_path() {
        let keys = parse_key_path("/KEY4/KEY2/KEY1").unwrap();
        assert_eq!(keys, vec![b"KEY4".to_vec(), b"KEY2".to_vec(), b"KEY1".to_vec()]);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_key_path("KEY4/KEY2/KEY1").is_err());
        assert!(parse_key_path("/KEY4/KEY2/KEY1/").is_err());
        assert!(parse_key_path("//KEY4/KEY2/KEY1").is_err());
        assert!(parse_key_path("").is_err());
        assert!(parse_key_path("/").is_err());
    }

    #[test]
    fn escaping_round_trips() {
        let path = KeyPath::new()
            .append(b"store")
            .append(b"key/with/slashes")
            .append(b"plain")
            .to_path();
        let keys = parse_key_path(&path).unwrap();
        assert_eq!(
            keys,
            vec![
                b"store".to_vec(),
                b"key/with/slashes".to_vec(),
                b"plain".to_vec()
            ]
        );
    }

    #[test]
    fn non_utf8_keys_round_trip() {
        let raw = vec![0xff, 0x00, 0x41];
        let path = KeyPath::new().append(&raw).to_path();
        let keys = parse_key_path(&path).unwrap();
        assert_eq!(keys, vec![raw]);
    }
}
