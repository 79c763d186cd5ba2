use super::{id_from_base, Compensations, Task, TaskContext};
use crate::channel::{physical, sub_name};
use crate::error::{Error, Result};
use crate::node::QueryNode;
use crate::replica::SegmentKind;
use crate::Channel;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};
use vespid_protocol::{
    LoadKind, LoadSegmentsRequest, MsgBase, MsgType, Position, SegmentInfo, SegmentLoadInfo,
    Timestamp, UniqueId, WatchDmChannelsRequest,
};

/// Attaches the node to a collection's DML channels so live inserts flow
/// into the streaming replica.
///
/// Everything up to flow-graph creation is in-memory bookkeeping; the
/// graphs are the first externally observable effect and the rollback
/// boundary. Growing segments loaded along the way are removed again if
/// any later stage fails. Collection creation is never rolled back.
pub struct WatchDmChannelsTask {
    req: WatchDmChannelsRequest,
    node: Arc<QueryNode>,
    id: UniqueId,
}

impl WatchDmChannelsTask {
    pub fn new(req: WatchDmChannelsRequest, node: Arc<QueryNode>) -> Self {
        Self { req, node, id: 0 }
    }
}

#[async_trait]
impl Task for WatchDmChannelsTask {
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
                    "nil base in WatchDmChannels request"
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

        // resolve the load type when the coordinator left it open
        let load_meta = self.req.load_meta.clone().unwrap_or_default();
        let load_kind = match load_meta.load_kind {
            LoadKind::Unknown => {
                if self.req.partition_ids.is_empty() {
                    LoadKind::Collection
                } else {
                    LoadKind::Partition
                }
            }
            kind => kind,
        };

        // derive (virtual, physical) channel pairs; duplicates are a
        // coordinator bug and fail validation
        let mut v_channels: Vec<Channel> = Vec::new();
        let mut p_channels: Vec<Channel> = Vec::new();
        let mut vp_channels: HashMap<Channel, Channel> = HashMap::new();
        for watch_info in &self.req.infos {
            let v = watch_info.channel.clone();
            if vp_channels.contains_key(&v) {
                return Err(Error::DuplicateChannel(v));
            }
            let p = physical(&v);
            v_channels.push(v.clone());
            p_channels.push(p.clone());
            vp_channels.insert(v, p);
        }

        info!(
            collection_id,
            replica_id = self.req.replica_id,
            ?load_kind,
            v_channels = ?v_channels,
            p_channels = ?p_channels,
            "starting WatchDmChannels"
        );

        // collection metadata in both replicas (idempotent)
        let s_col = node
            .streaming()
            .add_collection(collection_id, self.req.schema.clone());
        let h_col = node
            .historical()
            .add_collection(collection_id, self.req.schema.clone());

        for vchannel in &v_channels {
            node.shard_clusters()
                .add_shard_cluster(collection_id, self.req.replica_id, vchannel);
        }

        // gather growing (unflushed) segments; ones without binlogs have
        // nothing to load yet
        let mut growing_infos: Vec<SegmentLoadInfo> = Vec::new();
        let mut growing_ids: Vec<UniqueId> = Vec::new();
        for watch_info in &self.req.infos {
            for segment in &watch_info.unflushed_segments {
                if segment.binlogs.is_empty() {
                    continue;
                }
                growing_infos.push(SegmentLoadInfo {
                    segment_id: segment.id,
                    partition_id: segment.partition_id,
                    collection_id: segment.collection_id,
                    binlog_paths: segment.binlogs.clone(),
                    statslog_paths: segment.statslogs.clone(),
                    deltalog_paths: segment.deltalogs.clone(),
                    num_rows: segment.num_rows,
                });
                growing_ids.push(segment.id);
            }
        }
        let load_req = LoadSegmentsRequest {
            // carry the parent task's message id
            base: self
                .req
                .base
                .as_ref()
                .map(|base| MsgBase::new(MsgType::LoadSegments, base.msg_id, base.timestamp)),
            collection_id,
            schema: self.req.schema.clone(),
            infos: growing_infos,
            load_meta: self.req.load_meta.clone(),
        };

        // partitions of the growing segments and of the load scope exist in
        // both replicas before anything is loaded
        for segment in &load_req.infos {
            node.streaming()
                .add_partition(collection_id, segment.partition_id)?;
            node.historical()
                .add_partition(collection_id, segment.partition_id)?;
        }
        for partition_id in &load_meta.partition_ids {
            node.historical().add_partition(collection_id, *partition_id)?;
            node.streaming().add_partition(collection_id, *partition_id)?;
        }

        info!(
            collection_id,
            growing_segments = ?growing_ids,
            "loading growing segments in WatchDmChannels"
        );
        if let Err(err) = node
            .loader()
            .load(&load_req, SegmentKind::Growing, ctx.token())
            .await
        {
            warn!(collection_id, error = %err, "growing segment load failed");
            return Err(err);
        }

        // from here on, failure removes the growing segments again
        let mut rollback = Compensations::new();
        {
            let streaming = node.streaming().clone();
            let growing_ids = growing_ids.clone();
            rollback.push(move || {
                for segment_id in &growing_ids {
                    streaming.remove_segment(*segment_id);
                }
            });
        }

        let config = node.config();
        let sub = sub_name(&config.sub_name_prefix, collection_id, config.node_id);

        // classify channels: a position without a message id means consume
        // from latest; otherwise stamp our group and seek
        let mut seek_positions: HashMap<Channel, Position> = HashMap::new();
        let mut latest_channels: HashSet<Channel> = HashSet::new();
        for watch_info in &self.req.infos {
            match &watch_info.seek_position {
                Some(position) if position.is_seekable() => {
                    let mut position = position.clone();
                    position.msg_group = sub.clone();
                    seek_positions.insert(watch_info.channel.clone(), position);
                }
                _ => {
                    latest_channels.insert(watch_info.channel.clone());
                }
            }
        }

        // excluded-segment bookkeeping: unflushed segments are covered by
        // the snapshot load, flushed/dropped segments checkpointed past the
        // seek position are covered by sealed loads. Their messages must not
        // be re-applied downstream.
        let unflushed_excluded: Vec<SegmentInfo> = self
            .req
            .infos
            .iter()
            .flat_map(|info| info.unflushed_segments.iter().cloned())
            .collect();
        node.streaming()
            .add_excluded_segments(collection_id, unflushed_excluded);

        let past_checkpoint = |segment: &SegmentInfo| -> bool {
            let Some(dml_position) = &segment.dml_position else {
                return false;
            };
            seek_positions.values().any(|position| {
                dml_position.channel == position.channel
                    && dml_position.timestamp > position.timestamp
            })
        };
        let flushed_excluded: Vec<SegmentInfo> = self
            .req
            .infos
            .iter()
            .flat_map(|info| info.flushed_segments.iter())
            .filter(|segment| past_checkpoint(segment))
            .cloned()
            .collect();
        node.streaming()
            .add_excluded_segments(collection_id, flushed_excluded);

        let dropped_excluded: Vec<SegmentInfo> = self
            .req
            .infos
            .iter()
            .flat_map(|info| info.dropped_segments.iter())
            .filter(|segment| past_checkpoint(segment))
            .cloned()
            .collect();
        node.streaming()
            .add_excluded_segments(collection_id, dropped_excluded);

        // first externally observable effect; rollback boundary
        let graphs = match node.flow_graphs().add_dml_flow_graphs(collection_id, &v_channels) {
            Ok(graphs) => graphs,
            Err(err) => {
                warn!(collection_id, error = %err, "adding DML flow graphs failed");
                rollback.run();
                return Err(err);
            }
        };
        {
            let flow_graphs = node.flow_graphs().clone();
            let channels = v_channels.clone();
            rollback.push(move || {
                flow_graphs.remove_dml_flow_graphs(&channels);
            });
        }

        // attach each graph to the bus on the physical channel
        for (channel, graph) in &graphs {
            if latest_channels.contains(channel) {
                if let Err(err) = graph.consume(&vp_channels[channel], &sub).await {
                    error!(collection_id, vchannel = %channel, error = %err,
                        "bus consume failed for DML channel");
                    rollback.run();
                    return Err(err);
                }
            }
            if let Some(position) = seek_positions.get(channel) {
                let mut position = position.clone();
                position.msg_group = sub.clone();
                position.channel = vp_channels[channel].clone();
                if let Err(err) = graph.seek(&position).await {
                    error!(collection_id, vchannel = %channel, error = %err,
                        "bus seek failed for DML channel");
                    rollback.run();
                    return Err(err);
                }
            }
        }

        s_col.add_v_channels(&v_channels);
        s_col.add_p_channels(&p_channels);
        s_col.set_load_kind(load_kind);

        h_col.add_v_channels(&v_channels);
        h_col.add_p_channels(&p_channels);
        h_col.set_load_kind(load_kind);

        for vchannel in &v_channels {
            node.tsafe().add_tsafe(vchannel);
        }

        // query shards follow their DML watermark; watch failures keep the
        // task alive
        for vchannel in &v_channels {
            if !node.query_shards().has_query_shard(vchannel) {
                node.query_shards()
                    .add_query_shard(collection_id, vchannel, self.req.replica_id);
            }
            match node.query_shards().get_query_shard(vchannel) {
                Ok(shard) => {
                    if let Err(err) = shard.watch_dml_tsafe() {
                        warn!(vchannel = %vchannel, error = %err, "query shard DML tSafe watch failed");
                    }
                }
                Err(err) => {
                    warn!(vchannel = %vchannel, error = %err, "failed to get query shard");
                }
            }
        }

        // only now do the channels go live
        for graph in graphs.values() {
            graph.start();
        }
        rollback.discard();

        info!(collection_id, v_channels = ?v_channels, "WatchDmChannels done");
        Ok(())
    }
}
