use super::{id_from_base, Task, TaskContext};
use crate::channel::sub_name;
use crate::error::Result;
use crate::node::QueryNode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vespid_protocol::{AddQueryChannelRequest, Timestamp, UniqueId};

/// Attaches the node's query-shard service to the coordinator-named query
/// response channel for a collection.
pub struct AddQueryChannelTask {
    req: AddQueryChannelRequest,
    node: Arc<QueryNode>,
    id: UniqueId,
}

impl AddQueryChannelTask {
    pub fn new(req: AddQueryChannelRequest, node: Arc<QueryNode>) -> Self {
        Self { req, node, id: 0 }
    }
}

#[async_trait]
impl Task for AddQueryChannelTask {
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
                    "nil base in AddQueryChannel request"
                );
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
        let collection_id = self.req.collection_id;
        info!(collection_id, "executing AddQueryChannel");

        let query_channel = self.node.query_shards().get_query_channel(collection_id);

        let config = self.node.config();
        let sub = sub_name(&config.sub_name_prefix, collection_id, config.node_id);

        if let Err(err) = query_channel
            .as_consumer(&self.req.query_channel, &sub, self.req.seek_position.as_ref())
            .await
        {
            warn!(
                collection_id,
                channel = %self.req.query_channel,
                error = %err,
                "query channel as consumer failed"
            );
            return Err(err);
        }

        query_channel.start();
        info!(collection_id, "AddQueryChannel done");
        Ok(())
    }
}
