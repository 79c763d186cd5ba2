use thiserror::Error;
use vespid_protocol::UniqueId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Collection not found: {0}")]
    CollectionNotFound(UniqueId),

    #[error("Partition not found: {0}")]
    PartitionNotFound(UniqueId),

    #[error("Duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("Flow graph already exists for channel: {0}")]
    FlowGraphExists(String),

    #[error("TSafe not found for channel: {0}")]
    TSafeNotFound(String),

    #[error("Query shard not found for channel: {0}")]
    QueryShardNotFound(String),

    #[error("Invalid channel name {0}: {1}")]
    InvalidChannelName(String, String),

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Segment load failed: {0}")]
    SegmentLoad(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task queue closed")]
    QueueClosed,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
