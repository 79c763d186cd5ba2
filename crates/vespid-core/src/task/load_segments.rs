use super::{id_from_base, Task, TaskContext};
use crate::error::Result;
use crate::node::QueryNode;
use crate::replica::SegmentKind;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vespid_protocol::{LoadSegmentsRequest, Timestamp, UniqueId};

/// Loads sealed segments into the historical replica.
///
/// Metadata writes are idempotent: re-running the same request neither
/// errors nor duplicates collections or partitions.
pub struct LoadSegmentsTask {
    req: LoadSegmentsRequest,
    node: Arc<QueryNode>,
    id: UniqueId,
}

impl LoadSegmentsTask {
    pub fn new(req: LoadSegmentsRequest, node: Arc<QueryNode>) -> Self {
        Self { req, node, id: 0 }
    }
}

#[async_trait]
impl Task for LoadSegmentsTask {
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
                warn!("nil base in LoadSegments request");
                0
            }
        }
    }

    fn on_enqueue(&mut self) -> Result<()> {
        self.set_id(id_from_base(self.req.base.as_ref()));
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        ctx.check()?;
        let node = &self.node;
        let collection_id = self.req.collection_id;
        info!(task_id = self.id, collection_id, "LoadSegments start");

        node.historical()
            .add_collection(collection_id, self.req.schema.clone());
        node.streaming()
            .add_collection(collection_id, self.req.schema.clone());

        if let Some(load_meta) = &self.req.load_meta {
            for partition_id in &load_meta.partition_ids {
                node.historical().add_partition(collection_id, *partition_id)?;
                node.streaming().add_partition(collection_id, *partition_id)?;
            }
        }

        if let Err(err) = node
            .loader()
            .load(&self.req, SegmentKind::Sealed, ctx.token())
            .await
        {
            warn!(collection_id, error = %err, "sealed segment load failed");
            return Err(err);
        }

        info!(task_id = self.id, collection_id, "LoadSegments done");
        Ok(())
    }
}
