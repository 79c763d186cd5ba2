use super::{id_from_base, Task, TaskContext};
use crate::error::{Error, Result};
use crate::node::QueryNode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vespid_protocol::{ReleasePartitionsRequest, Timestamp, UniqueId};

/// Drops partitions from both replicas.
///
/// Per-partition removal is best-effort: an unknown partition or a removal
/// error is logged and the task carries on, so one bad id never blocks the
/// rest of the release.
pub struct ReleasePartitionsTask {
    req: ReleasePartitionsRequest,
    node: Arc<QueryNode>,
    id: UniqueId,
}

impl ReleasePartitionsTask {
    pub fn new(req: ReleasePartitionsRequest, node: Arc<QueryNode>) -> Self {
        Self { req, node, id: 0 }
    }
}

#[async_trait]
impl Task for ReleasePartitionsTask {
    fn id(&self) -> UniqueId {
        self.id
    }

    fn set_id(&mut self, id: UniqueId) {
        self.id = id;
    }

    fn timestamp(&self) -> Timestamp {
        match &self.req.base {
            Some(base) => base.timestamp,
            None => {
                warn!(
                    collection_id = self.req.collection_id,
                    "nil base in ReleasePartitions request"
                );
                0
            }
        }
    }

    fn on_enqueue(&mut self) -> Result<()> {
        self.set_id(id_from_base(self.req.base.as_ref()));
        Ok(())
    }

    async fn execute(&mut self, _ctx: &TaskContext) -> Result<()> {
        let node = &self.node;
        let collection_id = self.req.collection_id;
        info!(
            collection_id,
            partition_ids = ?self.req.partition_ids,
            "executing ReleasePartitions"
        );

        // let in-flight reads drain before dropping partitions
        tokio::time::sleep(node.config().graceful_release()).await;

        node.historical().get_collection(collection_id).map_err(|err| {
            Error::Other(format!(
                "release partitions failed, collection {}: {}",
                collection_id, err
            ))
        })?;
        node.streaming().get_collection(collection_id).map_err(|err| {
            Error::Other(format!(
                "release partitions failed, collection {}: {}",
                collection_id, err
            ))
        })?;

        for partition_id in &self.req.partition_ids {
            if node.historical().has_partition(*partition_id) {
                if let Err(err) = node.historical().remove_partition(*partition_id) {
                    // keep going, release the remaining partitions
                    warn!(partition_id, error = %err, "historical partition remove failed");
                }
            } else {
                warn!(
                    collection_id,
                    partition_id, "partition not in historical replica"
                );
            }

            if node.streaming().has_partition(*partition_id) {
                if let Err(err) = node.streaming().remove_partition(*partition_id) {
                    warn!(partition_id, error = %err, "streaming partition remove failed");
                }
            } else {
                warn!(
                    collection_id,
                    partition_id, "partition not in streaming replica"
                );
            }
        }

        info!(
            collection_id,
            partition_ids = ?self.req.partition_ids,
            "ReleasePartitions done"
        );
        Ok(())
    }
}
