//! Serde utilities for bytes serialization
//!
//! Provides efficient serialization/deserialization for `bytes::Bytes` types.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serializer};

/// Serde module for `Bytes` fields
pub mod bytes_serde {
    use super::*;

    pub fn serialize<S>(val: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(&val[..], serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Bytes::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestMessage {
        #[serde(with = "bytes_serde")]
        data: Bytes,
    }

    #[test]
    fn test_bytes_serde_roundtrip() {
        let msg = TestMessage {
            data: Bytes::from("hello"),
        };

        let encoded = postcard::to_allocvec(&msg).unwrap();
        let decoded: TestMessage = postcard::from_bytes(&encoded).unwrap();

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_bytes_serde_empty() {
        let msg = TestMessage { data: Bytes::new() };

        let encoded = postcard::to_allocvec(&msg).unwrap();
        let decoded: TestMessage = postcard::from_bytes(&encoded).unwrap();

        assert_eq!(msg, decoded);
    }
}
