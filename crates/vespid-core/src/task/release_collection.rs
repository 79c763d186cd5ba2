use super::{id_from_base, Task, TaskContext};
use crate::error::{Error, Result};
use crate::node::{reclaim_memory, QueryNode};
use crate::replica::ReplicaRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vespid_protocol::{ReleaseCollectionRequest, Timestamp, UniqueId};

/// Which half of the node a release pass is tearing down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaSide {
    Streaming,
    Historical,
}

/// Tears a collection down across both replicas.
///
/// Streaming goes first so no new inserts land while historical state is
/// dismantled. Each replica pass quiesces the read path behind the query
/// gate only long enough to stamp the release timestamp.
pub struct ReleaseCollectionTask {
    req: ReleaseCollectionRequest,
    node: Arc<QueryNode>,
    id: UniqueId,
}

impl ReleaseCollectionTask {
    pub fn new(req: ReleaseCollectionRequest, node: Arc<QueryNode>) -> Self {
        Self { req, node, id: 0 }
    }

    async fn release_replica(
        &self,
        replica: &Arc<ReplicaRegistry>,
        side: ReplicaSide,
    ) -> Result<()> {
        let collection_id = self.req.collection_id;

        // block new reads while the release timestamp lands
        let gate = replica.query_write().await;
        let collection = match replica.get_collection(collection_id) {
            Ok(collection) => collection,
            Err(err) => {
                drop(gate);
                return Err(err);
            }
        };
        info!(collection_id, replica = replica.name(), "setting release timestamp");
        collection.set_release_ts(self.timestamp());
        drop(gate);

        let channels = match side {
            ReplicaSide::Streaming => {
                let channels = collection.v_channels();
                self.node.flow_graphs().remove_dml_flow_graphs(&channels);
                channels
            }
            ReplicaSide::Historical => {
                let channels = collection.v_delta_channels();
                self.node.flow_graphs().remove_delta_flow_graphs(&channels);
                channels
            }
        };

        for channel in &channels {
            info!(collection_id, channel = %channel, "releasing tSafe");
            self.node.tsafe().remove_tsafe(channel);
        }

        replica.remove_excluded_segments(collection_id);
        replica.remove_collection(collection_id)?;
        Ok(())
    }
}

#[async_trait]
impl Task for ReleaseCollectionTask {
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
                    "nil base in ReleaseCollection request"
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
        let collection_id = self.req.collection_id;
        info!(collection_id, "executing ReleaseCollection");

        // let in-flight reads drain before tearing anything down
        tokio::time::sleep(self.node.config().graceful_release()).await;

        self.release_replica(self.node.streaming(), ReplicaSide::Streaming)
            .await
            .map_err(|err| {
                Error::Other(format!(
                    "release collection failed, collection {}: {}",
                    collection_id, err
                ))
            })?;

        info!(collection_id, "releasing historical");
        self.release_replica(self.node.historical(), ReplicaSide::Historical)
            .await
            .map_err(|err| {
                Error::Other(format!(
                    "release collection failed, collection {}: {}",
                    collection_id, err
                ))
            })?;

        reclaim_memory();

        self.node.query_shards().release_collection(collection_id);
        self.node.shard_clusters().release_collection(collection_id);

        info!(collection_id, "ReleaseCollection done");
        Ok(())
    }
}
