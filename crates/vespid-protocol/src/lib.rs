//! Vespid Wire Protocol
//!
//! This crate defines the control-plane protocol spoken between the query
//! coordinator and a query node. It provides serialization/deserialization
//! for every request the coordinator can drive against a node.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────────────┬──────────────────────────────┐
//! │ Length (4 bytes)│ Payload (N bytes)            │
//! │ Big-endian u32  │ postcard-serialized message  │
//! └─────────────────┴──────────────────────────────┘
//! ```
//!
//! # Protocol Stability
//!
//! The enum variant order is significant for postcard serialization. Changes
//! to variant order will break wire compatibility with existing
//! coordinators/nodes. Add new variants only at the end of the enum.

mod error;
mod messages;
pub mod serde_utils;
mod types;

pub use error::{ProtocolError, Result};
pub use messages::{Request, Response};
pub use types::{
    AddQueryChannelRequest, ChannelWatchInfo, CollectionSchema, DataType, DeltaChannelInfo,
    FieldSchema, LoadKind, LoadMeta, LoadSegmentsRequest, MsgBase, MsgType, Position,
    ReleaseCollectionRequest, ReleasePartitionsRequest, SegmentInfo, SegmentLoadInfo, Timestamp,
    UniqueId, WatchDeltaChannelsRequest, WatchDmChannelsRequest,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum control-plane message size (16 MiB)
///
/// Control messages carry segment metadata, not segment data; anything
/// larger than this indicates a corrupt or hostile frame.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
