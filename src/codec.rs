//! Key/Value Codecs
//!
//! The pipeline only ever moves bytes. Domain keys and values cross into and
//! out of it through a [`Codec`], which the command catalogue applies when it
//! builds arguments and when typed outputs materialize bulk replies.

use bytes::Bytes;

/// A pair of pure conversions between domain keys/values and wire bytes.
pub trait Codec: Send + Sync + 'static {
    type Key: Send + 'static;
    type Value: Send + 'static;

    fn encode_key(&self, key: &Self::Key) -> Bytes;
    fn decode_key(&self, bytes: Bytes) -> Self::Key;
    fn encode_value(&self, value: &Self::Value) -> Bytes;
    fn decode_value(&self, bytes: Bytes) -> Self::Value;
}

/// Keys and values are UTF-8 strings; invalid sequences are replaced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    type Key = String;
    type Value = String;

    fn encode_key(&self, key: &String) -> Bytes {
        Bytes::copy_from_slice(key.as_bytes())
    }

    fn decode_key(&self, bytes: Bytes) -> String {
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn encode_value(&self, value: &String) -> Bytes {
        Bytes::copy_from_slice(value.as_bytes())
    }

    fn decode_value(&self, bytes: Bytes) -> String {
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Keys and values pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Key = Bytes;
    type Value = Bytes;

    fn encode_key(&self, key: &Bytes) -> Bytes {
        key.clone()
    }

    fn decode_key(&self, bytes: Bytes) -> Bytes {
        bytes
    }

    fn encode_value(&self, value: &Bytes) -> Bytes {
        value.clone()
    }

    fn decode_value(&self, bytes: Bytes) -> Bytes {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_codec_lossy_decode() {
        let codec = Utf8Codec;
        assert_eq!(codec.encode_key(&"user:1".to_string()), Bytes::from("user:1"));
        assert_eq!(codec.decode_value(Bytes::from(&b"a\xffb"[..])), "a\u{fffd}b");
    }

    #[test]
    fn test_bytes_codec_passthrough() {
        let codec = BytesCodec;
        let raw = Bytes::from(&b"\x00\x01"[..]);
        assert_eq!(codec.decode_key(codec.encode_key(&raw)), raw);
    }
}
