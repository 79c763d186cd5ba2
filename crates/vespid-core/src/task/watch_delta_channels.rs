use super::{id_from_base, Compensations, Task, TaskContext};
use crate::channel::{convert_channel, physical, sub_name};
use crate::error::{Error, Result};
use crate::node::QueryNode;
use crate::Channel;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use vespid_protocol::{Position, Timestamp, UniqueId, WatchDeltaChannelsRequest};

/// Attaches the node to a collection's delta channels so deletes flow into
/// both replicas.
///
/// Requires the collection to already exist (a prior WatchDmChannels or
/// LoadSegments created it). Delta graphs always consume from latest; the
/// gap up to now is covered by replaying deletes from each channel's DML
/// checkpoint.
pub struct WatchDeltaChannelsTask {
    req: WatchDeltaChannelsRequest,
    node: Arc<QueryNode>,
    id: UniqueId,
}

impl WatchDeltaChannelsTask {
    pub fn new(req: WatchDeltaChannelsRequest, node: Arc<QueryNode>) -> Self {
        Self { req, node, id: 0 }
    }
}

#[async_trait]
impl Task for WatchDeltaChannelsTask {
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
                    "nil base in WatchDeltaChannels request"
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
        let node = &self.node;
        let collection_id = self.req.collection_id;

        let mut v_delta_channels: Vec<Channel> = Vec::new();
        let mut p_delta_channels: Vec<Channel> = Vec::new();
        let mut vp_channels: HashMap<Channel, Channel> = HashMap::new();
        let mut seek_by_channel: HashMap<Channel, Option<Position>> = HashMap::new();
        for delta_info in &self.req.infos {
            let v = delta_info.channel.clone();
            if vp_channels.contains_key(&v) {
                return Err(Error::DuplicateChannel(v));
            }
            let p = physical(&v);
            v_delta_channels.push(v.clone());
            p_delta_channels.push(p.clone());
            vp_channels.insert(v.clone(), p);
            seek_by_channel.insert(v, delta_info.seek_position.clone());
        }

        info!(
            collection_id,
            v_delta_channels = ?v_delta_channels,
            p_delta_channels = ?p_delta_channels,
            "starting WatchDeltaChannels"
        );

        // a delta watch without a prior DM watch or segment load is a
        // coordinator ordering bug
        if !node.historical().has_collection(collection_id) {
            return Err(Error::CollectionNotFound(collection_id));
        }
        let h_col = node.historical().get_collection(collection_id)?;

        if !node.streaming().has_collection(collection_id) {
            return Err(Error::CollectionNotFound(collection_id));
        }
        let s_col = node.streaming().get_collection(collection_id)?;

        let graphs = match node
            .flow_graphs()
            .add_delta_flow_graphs(collection_id, &v_delta_channels)
        {
            Ok(graphs) => graphs,
            Err(err) => {
                warn!(collection_id, error = %err, "adding delta flow graphs failed");
                return Err(err);
            }
        };
        let mut rollback = Compensations::new();
        {
            let flow_graphs = node.flow_graphs().clone();
            let channels = v_delta_channels.clone();
            rollback.push(move || {
                flow_graphs.remove_delta_flow_graphs(&channels);
            });
        }

        let config = node.config();
        let sub = sub_name(&config.sub_name_prefix, collection_id, config.node_id);

        // attach from latest, then close the gap by replaying deletes from
        // the DML checkpoint
        for (channel, graph) in &graphs {
            if let Err(err) = graph.consume_from_latest(&vp_channels[channel], &sub).await {
                error!(collection_id, vchannel = %channel, error = %err,
                    "bus consume failed for delta channel");
                rollback.run();
                return Err(err);
            }
            if let Err(err) = node
                .loader()
                .load_deletes_from_checkpoint(
                    collection_id,
                    seek_by_channel[channel].as_ref(),
                    ctx.token(),
                )
                .await
            {
                error!(collection_id, vchannel = %channel, error = %err,
                    "delete replay from DML checkpoint failed");
                rollback.run();
                return Err(err);
            }
        }

        h_col.add_v_delta_channels(&v_delta_channels);
        h_col.add_p_delta_channels(&p_delta_channels);

        s_col.add_v_delta_channels(&v_delta_channels);
        s_col.add_p_delta_channels(&p_delta_channels);

        for vchannel in &v_delta_channels {
            node.tsafe().add_tsafe(vchannel);
        }

        // pair each delta channel with its DML shard and follow the delta
        // watermark there; conversion or watch failures skip the channel
        for vchannel in &v_delta_channels {
            let dml_channel = match convert_channel(
                vchannel,
                &config.delta_channel_root,
                &config.dml_channel_root,
            ) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(vchannel = %vchannel, error = %err,
                        "failed to convert delta channel to DML channel");
                    continue;
                }
            };
            if !node.query_shards().has_query_shard(&dml_channel) {
                node.query_shards()
                    .add_query_shard(collection_id, &dml_channel, self.req.replica_id);
            }
            match node.query_shards().get_query_shard(&dml_channel) {
                Ok(shard) => {
                    if let Err(err) = shard.watch_delta_tsafe() {
                        warn!(dml_channel = %dml_channel, error = %err,
                            "query shard delta tSafe watch failed");
                    }
                }
                Err(err) => {
                    warn!(dml_channel = %dml_channel, error = %err, "failed to get query shard");
                }
            }
        }

        for graph in graphs.values() {
            graph.start();
        }
        rollback.discard();

        info!(collection_id, v_delta_channels = ?v_delta_channels, "WatchDeltaChannels done");
        Ok(())
    }
}
