//! Shard-cluster registry.
//!
//! A shard cluster groups the nodes serving one (collection, replica,
//! vchannel) shard; its distributed behavior lives elsewhere. The control
//! plane registers one per watched DML channel and drops them with the
//! collection.

use crate::Channel;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use vespid_protocol::UniqueId;

/// Identity of one shard this node participates in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCluster {
    pub collection_id: UniqueId,
    pub replica_id: i64,
    pub vchannel: Channel,
}

/// Registry of shard clusters keyed by virtual channel
#[derive(Debug, Default)]
pub struct ShardClusterService {
    clusters: DashMap<Channel, Arc<ShardCluster>>,
}

impl ShardClusterService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard cluster; re-registering the same channel keeps the
    /// existing entry
    pub fn add_shard_cluster(
        &self,
        collection_id: UniqueId,
        replica_id: i64,
        vchannel: &str,
    ) -> Arc<ShardCluster> {
        self.clusters
            .entry(vchannel.to_string())
            .or_insert_with(|| {
                debug!(collection_id, replica_id, vchannel, "shard cluster registered");
                Arc::new(ShardCluster {
                    collection_id,
                    replica_id,
                    vchannel: vchannel.to_string(),
                })
            })
            .clone()
    }

    pub fn has_shard_cluster(&self, vchannel: &str) -> bool {
        self.clusters.contains_key(vchannel)
    }

    pub fn get_shard_cluster(&self, vchannel: &str) -> Option<Arc<ShardCluster>> {
        self.clusters.get(vchannel).map(|e| e.clone())
    }

    /// Drop every shard cluster of a collection
    pub fn release_collection(&self, collection_id: UniqueId) {
        self.clusters.retain(|_, sc| sc.collection_id != collection_id);
        debug!(collection_id, "shard clusters released");
    }

    pub fn count(&self) -> usize {
        self.clusters.len()
    }
}
