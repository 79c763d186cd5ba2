//! Control-plane data types shared by the coordinator and query nodes

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 63-bit signed identifier for collections, partitions, segments and
/// request messages. Always positive when assigned.
pub type UniqueId = i64;

/// 64-bit hybrid logical timestamp minted by the coordinator's TSO.
/// Ordering of control-plane effects is defined by this value.
pub type Timestamp = u64;

/// Control-plane message kind carried in [`MsgBase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    AddQueryChannel,
    WatchDmChannels,
    WatchDeltaChannels,
    LoadSegments,
    ReleaseCollection,
    ReleasePartitions,
}

/// Common request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgBase {
    pub msg_type: MsgType,
    /// Coordinator-assigned message id; becomes the task id on the node
    pub msg_id: UniqueId,
    pub timestamp: Timestamp,
}

impl MsgBase {
    pub fn new(msg_type: MsgType, msg_id: UniqueId, timestamp: Timestamp) -> Self {
        Self {
            msg_type,
            msg_id,
            timestamp,
        }
    }
}

/// A position in a message-bus channel.
///
/// An empty `msg_id` means "consume from latest"; a non-empty `msg_id`
/// means "seek to this position, then consume". `msg_group` carries the
/// subscription-group name and is stamped by the node before seeking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub channel: String,
    #[serde(with = "crate::serde_utils::bytes_serde")]
    pub msg_id: Bytes,
    pub msg_group: String,
    pub timestamp: Timestamp,
}

impl Position {
    /// Whether this position carries a concrete message id to seek to
    pub fn is_seekable(&self) -> bool {
        !self.msg_id.is_empty()
    }
}

/// Scalar and vector field types supported by collection schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float,
    Double,
    VarChar,
    FloatVector,
    BinaryVector,
}

/// One field of a collection schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_id: i64,
    pub name: String,
    pub data_type: DataType,
    /// Vector dimensionality; 0 for scalar fields
    #[serde(default)]
    pub dim: u32,
}

/// Collection schema as the coordinator hands it down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

/// Durable-segment checkpoint record used for excluded-segment filtering.
///
/// `dml_position` is the segment's checkpoint in its DML channel. Dropped
/// segments may arrive without one; consumers must treat it as optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    #[serde(default)]
    pub binlogs: Vec<String>,
    #[serde(default)]
    pub statslogs: Vec<String>,
    #[serde(default)]
    pub deltalogs: Vec<String>,
    pub num_rows: i64,
    pub dml_position: Option<Position>,
}

/// Everything the segment loader needs to materialize one segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentLoadInfo {
    pub segment_id: UniqueId,
    pub partition_id: UniqueId,
    pub collection_id: UniqueId,
    #[serde(default)]
    pub binlog_paths: Vec<String>,
    #[serde(default)]
    pub statslog_paths: Vec<String>,
    #[serde(default)]
    pub deltalog_paths: Vec<String>,
    pub num_rows: i64,
}

/// How a collection was loaded onto the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadKind {
    #[default]
    Unknown,
    Collection,
    Partition,
}

/// Load scope metadata attached to watch/load requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadMeta {
    pub load_kind: LoadKind,
    #[serde(default)]
    pub partition_ids: Vec<UniqueId>,
}

/// Per-DML-channel watch instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelWatchInfo {
    /// Virtual channel name
    pub channel: String,
    pub seek_position: Option<Position>,
    #[serde(default)]
    pub unflushed_segments: Vec<SegmentInfo>,
    #[serde(default)]
    pub flushed_segments: Vec<SegmentInfo>,
    #[serde(default)]
    pub dropped_segments: Vec<SegmentInfo>,
}

/// Per-delta-channel watch instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaChannelInfo {
    /// Virtual delta channel name
    pub channel: String,
    /// DML checkpoint to replay deletes from
    pub seek_position: Option<Position>,
}

/// Attach the node's query-shard service to a query response channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddQueryChannelRequest {
    pub base: Option<MsgBase>,
    pub collection_id: UniqueId,
    pub query_channel: String,
    pub seek_position: Option<Position>,
}

/// Attach the node to DML channels so live inserts flow into streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchDmChannelsRequest {
    pub base: Option<MsgBase>,
    pub collection_id: UniqueId,
    #[serde(default)]
    pub partition_ids: Vec<UniqueId>,
    pub schema: Option<CollectionSchema>,
    pub replica_id: i64,
    pub infos: Vec<ChannelWatchInfo>,
    pub load_meta: Option<LoadMeta>,
}

/// Attach the node to delta channels so deletes flow into both replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchDeltaChannelsRequest {
    pub base: Option<MsgBase>,
    pub collection_id: UniqueId,
    pub replica_id: i64,
    pub infos: Vec<DeltaChannelInfo>,
}

/// Load sealed segments into the historical replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSegmentsRequest {
    pub base: Option<MsgBase>,
    pub collection_id: UniqueId,
    pub schema: Option<CollectionSchema>,
    pub infos: Vec<SegmentLoadInfo>,
    pub load_meta: Option<LoadMeta>,
}

/// Tear down a collection across both replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseCollectionRequest {
    pub base: Option<MsgBase>,
    pub collection_id: UniqueId,
}

/// Drop partitions from both replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePartitionsRequest {
    pub base: Option<MsgBase>,
    pub collection_id: UniqueId,
    pub partition_ids: Vec<UniqueId>,
}
