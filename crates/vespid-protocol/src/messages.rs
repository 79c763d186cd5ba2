//! Protocol message types

use crate::error::Result;
use crate::types::{
    AddQueryChannelRequest, LoadSegmentsRequest, ReleaseCollectionRequest,
    ReleasePartitionsRequest, WatchDeltaChannelsRequest, WatchDmChannelsRequest,
};
use serde::{Deserialize, Serialize};

/// Protocol request messages
///
/// # Stability
///
/// **WARNING**: Variant order must remain stable for postcard serialization
/// compatibility. Add new variants only at the end of the enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe
    Ping,

    /// Node status summary
    Status,

    AddQueryChannel(AddQueryChannelRequest),

    WatchDmChannels(WatchDmChannelsRequest),

    WatchDeltaChannels(WatchDeltaChannelsRequest),

    LoadSegments(LoadSegmentsRequest),

    ReleaseCollection(ReleaseCollectionRequest),

    ReleasePartitions(ReleasePartitionsRequest),
}

/// Protocol response messages
///
/// # Stability
///
/// **WARNING**: Variant order must remain stable for postcard serialization
/// compatibility. Add new variants only at the end of the enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Pong,

    /// Request executed successfully
    Ok,

    /// Request failed; the task's first error
    Error { message: String },

    /// Node status summary
    Status {
        node_id: i64,
        streaming_collections: u64,
        historical_collections: u64,
    },
}

impl Request {
    /// Serialize request to bytes (postcard format, no length prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize request from bytes (postcard format)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data)
            .map_err(|e| crate::error::ProtocolError::Deserialization(e.to_string()))
    }
}

impl Response {
    /// Serialize response to bytes (postcard format, no length prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize response from bytes (postcard format)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data)
            .map_err(|e| crate::error::ProtocolError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MsgBase, MsgType, Position};
    use bytes::Bytes;

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            Request::Ping,
            Request::Status,
            Request::ReleaseCollection(ReleaseCollectionRequest {
                base: Some(MsgBase::new(MsgType::ReleaseCollection, 42, 1000)),
                collection_id: 100,
            }),
            Request::ReleasePartitions(ReleasePartitionsRequest {
                base: None,
                collection_id: 100,
                partition_ids: vec![1, 2, 3],
            }),
            Request::AddQueryChannel(AddQueryChannelRequest {
                base: Some(MsgBase::new(MsgType::AddQueryChannel, 7, 500)),
                collection_id: 100,
                query_channel: "vespid-query-100".to_string(),
                seek_position: Some(Position {
                    channel: "vespid-query-100".to_string(),
                    msg_id: Bytes::from_static(b"abc"),
                    msg_group: String::new(),
                    timestamp: 500,
                }),
            }),
        ];

        for request in requests {
            let bytes = request.to_bytes().expect("serialize failed");
            let decoded = Request::from_bytes(&bytes).expect("deserialize failed");

            // Verify roundtrip by re-serializing
            let bytes2 = decoded.to_bytes().expect("re-serialize failed");
            assert_eq!(bytes, bytes2, "roundtrip failed for {:?}", request);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            Response::Pong,
            Response::Ok,
            Response::Error {
                message: "cannot find collection 200".to_string(),
            },
            Response::Status {
                node_id: 3,
                streaming_collections: 1,
                historical_collections: 2,
            },
        ];

        for response in responses {
            let bytes = response.to_bytes().expect("serialize failed");
            let decoded = Response::from_bytes(&bytes).expect("deserialize failed");

            let bytes2 = decoded.to_bytes().expect("re-serialize failed");
            assert_eq!(bytes, bytes2, "roundtrip failed for {:?}", response);
        }
    }

    #[test]
    fn test_truncated_request() {
        let request = Request::ReleaseCollection(ReleaseCollectionRequest {
            base: Some(MsgBase::new(MsgType::ReleaseCollection, 1, 1)),
            collection_id: 5,
        });
        let bytes = request.to_bytes().unwrap();

        // Truncate the data
        let truncated = &bytes[..bytes.len().saturating_sub(1)];
        assert!(Request::from_bytes(truncated).is_err());
    }

    #[test]
    fn test_request_from_arbitrary_bytes() {
        // Random garbage should not crash, just return error
        let garbage = vec![0xFF, 0xFE, 0x00, 0x01, 0x02];
        let result = Request::from_bytes(&garbage);
        let _ = result;
    }
}
