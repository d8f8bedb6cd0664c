//! Request paths for the remote store.
//!
//! The store exposes two resources:
//!
//! - `fields/{key}`: whole JSON blobs, the key base64url-encoded (no padding)
//! - `logs/{collection}`: append-only operation logs, the collection name
//!   percent-encoded

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use opsync_core::Collection;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters escaped in a collection segment.
const SEGMENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'/')
    .add(b'\\');

/// Field key holding the persisted snapshot of a broadcast data type.
#[must_use]
pub fn snapshot_key(data_type: &str) -> String {
    format!("snapshots/{data_type}")
}

/// Encode a field key for use in a path.
///
/// # Examples
///
/// ```
/// use opsync_remote::encode_key;
///
/// let encoded = encode_key("snapshots/completed");
/// assert!(!encoded.contains('='));
/// assert!(!encoded.contains('/'));
/// ```
#[must_use]
pub fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Recover a field key from its path form.
///
/// # Errors
///
/// Returns error if the input is not base64url or not UTF-8.
pub fn decode_key(encoded: &str) -> Result<String, EncodingError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| EncodingError::Base64Decode(e.to_string()))?;

    String::from_utf8(bytes).map_err(|e| EncodingError::Utf8Decode(e.to_string()))
}

/// Path of a field relative to the store's base URL.
#[must_use]
pub fn field_path(key: &str) -> String {
    format!("fields/{}", encode_key(key))
}

/// Path of a collection's operation log relative to the store's base URL.
#[must_use]
pub fn log_path(collection: &Collection) -> String {
    format!(
        "logs/{}",
        utf8_percent_encode(collection.as_str(), SEGMENT_ESCAPE)
    )
}

/// Errors decoding a field key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
    /// Not base64url
    #[error("base64 decode error: {0}")]
    Base64Decode(String),
    /// Decoded bytes are not UTF-8
    #[error("UTF-8 decode error: {0}")]
    Utf8Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_survive_the_path() {
        for key in ["a", "ab", "abc", "snapshots/completed", "einkäufe/日程"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('='), "'{key}' encoded with padding: {encoded}");
            assert!(!encoded.contains('/'));
            assert_eq!(decode_key(&encoded).unwrap(), key);
        }
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(matches!(
            decode_key("not base64!"),
            Err(EncodingError::Base64Decode(_))
        ));
        assert!(matches!(
            decode_key(&URL_SAFE_NO_PAD.encode([0xff, 0xfe])),
            Err(EncodingError::Utf8Decode(_))
        ));
    }

    #[test]
    fn paths() {
        assert_eq!(field_path("settings"), format!("fields/{}", encode_key("settings")));
        assert_eq!(log_path(&Collection::Tasks), "logs/tasks");
        assert_eq!(
            log_path(&Collection::Other("stock/room A".to_string())),
            "logs/stock%2Froom%20A"
        );
        assert_eq!(snapshot_key("completed"), "snapshots/completed");
    }
}
