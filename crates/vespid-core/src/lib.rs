//! Vespid query-node core
//!
//! The control-plane task subsystem of a query node in a Vespid cluster.
//! A query node serves vector similarity reads over collections partitioned
//! into shards, holding two parallel in-memory replicas: a *streaming*
//! replica fed by live message-bus channels and a *historical* replica
//! populated from durable segments.
//!
//! The coordinator drives the node through six request kinds: attach to a
//! query channel, watch DML channels, watch delta channels, load sealed
//! segments, release a collection, release partitions. Each request becomes
//! a [`task::Task`] executed by a single-worker [`task::TaskQueue`], so the
//! node's control-plane effects are strictly serialized while the read path
//! keeps flowing.

pub mod bus;
pub mod channel;
pub mod collection;
pub mod config;
pub mod error;
pub mod flowgraph;
pub mod loader;
pub mod node;
pub mod query_shard;
pub mod replica;
pub mod shard_cluster;
pub mod task;
pub mod tsafe;

pub use bus::{BusConsumer, BusPacket, MemoryBus, MsgBus, SubscribeFrom};
pub use collection::Collection;
pub use config::Config;
pub use error::{Error, Result};
pub use flowgraph::{FlowGraph, FlowGraphService};
pub use loader::SegmentLoader;
pub use node::QueryNode;
pub use query_shard::{QueryChannel, QueryShard, QueryShardService};
pub use replica::{ReplicaRegistry, Segment, SegmentKind};
pub use shard_cluster::ShardClusterService;
pub use task::{Task, TaskHandle, TaskQueue};
pub use tsafe::TSafeReplica;

/// Re-exported id/timestamp primitives shared with the wire protocol
pub use vespid_protocol::{Timestamp, UniqueId};

/// Logical channel name
pub type Channel = String;
