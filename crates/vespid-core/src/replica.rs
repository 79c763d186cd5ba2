//! In-memory collection/partition/segment catalog, one per replica.
//!
//! A query node holds two of these: the *streaming* replica (growing
//! segments fed by DML channels) and the *historical* replica (sealed
//! segments loaded from object storage). Both expose the same registry
//! surface plus a coarse per-replica query gate that release tasks take as
//! writer to quiesce the read path.

use crate::collection::Collection;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::debug;
use vespid_protocol::{CollectionSchema, SegmentInfo, UniqueId};

/// Whether a segment is mutable and stream-fed or immutable and durable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Growing,
    Sealed,
}

/// A segment held by a replica. Row data lives in the read path; the
/// registry tracks identity and shape only.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub kind: SegmentKind,
    pub num_rows: i64,
}

#[derive(Debug)]
pub struct ReplicaRegistry {
    /// "streaming" or "historical", for logs
    name: &'static str,
    collections: parking_lot::RwLock<HashMap<UniqueId, Arc<Collection>>>,
    /// partition id -> owning collection id
    partitions: parking_lot::RwLock<HashMap<UniqueId, UniqueId>>,
    segments: parking_lot::RwLock<HashMap<UniqueId, Segment>>,
    /// Segments whose bus messages downstream filters must drop, keyed by
    /// collection id
    excluded: parking_lot::RwLock<HashMap<UniqueId, Vec<SegmentInfo>>>,
    /// Writer-preferring gate; release holds it as writer while stamping
    /// the release timestamp, readers hold it across query execution
    query_gate: AsyncRwLock<()>,
}

impl ReplicaRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            collections: parking_lot::RwLock::new(HashMap::new()),
            partitions: parking_lot::RwLock::new(HashMap::new()),
            segments: parking_lot::RwLock::new(HashMap::new()),
            excluded: parking_lot::RwLock::new(HashMap::new()),
            query_gate: AsyncRwLock::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    // ---- collections ----

    /// Add a collection, returning the existing handle if already present
    pub fn add_collection(
        &self,
        id: UniqueId,
        schema: Option<CollectionSchema>,
    ) -> Arc<Collection> {
        let mut collections = self.collections.write();
        collections
            .entry(id)
            .or_insert_with(|| {
                debug!(replica = self.name, collection_id = id, "collection added");
                Arc::new(Collection::new(id, schema))
            })
            .clone()
    }

    pub fn has_collection(&self, id: UniqueId) -> bool {
        self.collections.read().contains_key(&id)
    }

    pub fn get_collection(&self, id: UniqueId) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::CollectionNotFound(id))
    }

    pub fn collection_count(&self) -> usize {
        self.collections.read().len()
    }

    /// Remove a collection with its partitions and segments
    pub fn remove_collection(&self, id: UniqueId) -> Result<()> {
        self.collections
            .write()
            .remove(&id)
            .ok_or(Error::CollectionNotFound(id))?;
        self.partitions.write().retain(|_, cid| *cid != id);
        self.segments.write().retain(|_, seg| seg.collection_id != id);
        debug!(replica = self.name, collection_id = id, "collection removed");
        Ok(())
    }

    // ---- partitions ----

    /// Register a partition under a collection; idempotent
    pub fn add_partition(&self, collection_id: UniqueId, partition_id: UniqueId) -> Result<()> {
        if !self.has_collection(collection_id) {
            return Err(Error::CollectionNotFound(collection_id));
        }
        self.partitions.write().insert(partition_id, collection_id);
        Ok(())
    }

    pub fn has_partition(&self, partition_id: UniqueId) -> bool {
        self.partitions.read().contains_key(&partition_id)
    }

    /// Remove a partition and its segments
    pub fn remove_partition(&self, partition_id: UniqueId) -> Result<()> {
        self.partitions
            .write()
            .remove(&partition_id)
            .ok_or(Error::PartitionNotFound(partition_id))?;
        self.segments
            .write()
            .retain(|_, seg| seg.partition_id != partition_id);
        Ok(())
    }

    /// Partition ids currently registered under a collection
    pub fn partition_ids(&self, collection_id: UniqueId) -> Vec<UniqueId> {
        self.partitions
            .read()
            .iter()
            .filter(|(_, cid)| **cid == collection_id)
            .map(|(pid, _)| *pid)
            .collect()
    }

    // ---- segments ----

    /// Register a segment; its partition must already be registered
    pub fn add_segment(&self, segment: Segment) -> Result<()> {
        if !self.has_partition(segment.partition_id) {
            return Err(Error::PartitionNotFound(segment.partition_id));
        }
        self.segments.write().insert(segment.id, segment);
        Ok(())
    }

    pub fn has_segment(&self, segment_id: UniqueId) -> bool {
        self.segments.read().contains_key(&segment_id)
    }

    /// Remove a segment; removing a missing segment is a no-op (release and
    /// watch-rollback may race over the same id)
    pub fn remove_segment(&self, segment_id: UniqueId) {
        self.segments.write().remove(&segment_id);
    }

    pub fn segment_ids(&self, collection_id: UniqueId) -> Vec<UniqueId> {
        self.segments
            .read()
            .values()
            .filter(|seg| seg.collection_id == collection_id)
            .map(|seg| seg.id)
            .collect()
    }

    // ---- excluded segments ----

    /// Extend the excluded set for a collection
    pub fn add_excluded_segments(&self, collection_id: UniqueId, infos: Vec<SegmentInfo>) {
        if infos.is_empty() {
            return;
        }
        self.excluded
            .write()
            .entry(collection_id)
            .or_default()
            .extend(infos);
    }

    pub fn get_excluded_segments(&self, collection_id: UniqueId) -> Vec<SegmentInfo> {
        self.excluded
            .read()
            .get(&collection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_excluded_segments(&self, collection_id: UniqueId) {
        self.excluded.write().remove(&collection_id);
    }

    // ---- query gate ----

    /// Block until no release is in flight; hold across read execution
    pub async fn query_read(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.query_gate.read().await
    }

    /// Quiesce the read path; held by release while stamping release state
    pub async fn query_write(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.query_gate.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn growing(id: UniqueId, collection_id: UniqueId, partition_id: UniqueId) -> Segment {
        Segment {
            id,
            collection_id,
            partition_id,
            kind: SegmentKind::Growing,
            num_rows: 0,
        }
    }

    #[test]
    fn test_add_collection_idempotent() {
        let replica = ReplicaRegistry::new("streaming");
        let a = replica.add_collection(1, None);
        let b = replica.add_collection(1, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(replica.collection_count(), 1);
    }

    #[test]
    fn test_partition_requires_collection() {
        let replica = ReplicaRegistry::new("streaming");
        assert!(matches!(
            replica.add_partition(1, 10),
            Err(Error::CollectionNotFound(1))
        ));

        replica.add_collection(1, None);
        replica.add_partition(1, 10).unwrap();
        // idempotent
        replica.add_partition(1, 10).unwrap();
        assert!(replica.has_partition(10));
        assert_eq!(replica.partition_ids(1), vec![10]);
    }

    #[test]
    fn test_segment_lifecycle() {
        let replica = ReplicaRegistry::new("streaming");
        replica.add_collection(1, None);

        // partition not registered yet
        assert!(replica.add_segment(growing(100, 1, 10)).is_err());

        replica.add_partition(1, 10).unwrap();
        replica.add_segment(growing(100, 1, 10)).unwrap();
        assert!(replica.has_segment(100));

        replica.remove_segment(100);
        assert!(!replica.has_segment(100));
        // double remove tolerated
        replica.remove_segment(100);
    }

    #[test]
    fn test_remove_partition_drops_segments() {
        let replica = ReplicaRegistry::new("historical");
        replica.add_collection(1, None);
        replica.add_partition(1, 10).unwrap();
        replica.add_segment(growing(100, 1, 10)).unwrap();

        replica.remove_partition(10).unwrap();
        assert!(!replica.has_segment(100));
        assert!(matches!(
            replica.remove_partition(10),
            Err(Error::PartitionNotFound(10))
        ));
    }

    #[test]
    fn test_remove_collection_drops_everything() {
        let replica = ReplicaRegistry::new("streaming");
        replica.add_collection(1, None);
        replica.add_partition(1, 10).unwrap();
        replica.add_segment(growing(100, 1, 10)).unwrap();

        replica.remove_collection(1).unwrap();
        assert!(!replica.has_collection(1));
        assert!(!replica.has_partition(10));
        assert!(!replica.has_segment(100));

        assert!(replica.remove_collection(1).is_err());
    }

    #[test]
    fn test_excluded_segments() {
        let replica = ReplicaRegistry::new("streaming");
        let info = SegmentInfo {
            id: 7,
            collection_id: 1,
            partition_id: 10,
            binlogs: vec![],
            statslogs: vec![],
            deltalogs: vec![],
            num_rows: 0,
            dml_position: None,
        };

        replica.add_excluded_segments(1, vec![info.clone()]);
        replica.add_excluded_segments(1, vec![info]);
        assert_eq!(replica.get_excluded_segments(1).len(), 2);

        replica.remove_excluded_segments(1);
        assert!(replica.get_excluded_segments(1).is_empty());
    }

    #[tokio::test]
    async fn test_query_gate_blocks_writer() {
        let replica = Arc::new(ReplicaRegistry::new("streaming"));

        let read_guard = replica.query_read().await;
        let contender = {
            let replica = replica.clone();
            tokio::spawn(async move {
                let _w = replica.query_write().await;
            })
        };
        // writer cannot finish while a reader holds the gate
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(read_guard);
        contender.await.unwrap();
    }
}
