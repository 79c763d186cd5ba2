//! Flow graphs: per-channel pipelines applying bus traffic to a replica.
//!
//! The DAG internals of the pipeline live in the read path; what the
//! control plane owns is the lifecycle: create a graph per virtual
//! channel, point it at a physical channel (from latest or seeked to a
//! checkpoint), start it, and tear it down on release or rollback. A
//! running graph advances its channel's tSafe watermark as packets drain.

use crate::bus::{BusConsumer, MsgBus, SubscribeFrom};
use crate::error::{Error, Result};
use crate::tsafe::TSafeReplica;
use crate::Channel;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vespid_protocol::{Position, UniqueId};

/// Which stream family a graph consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Dml,
    Delta,
}

/// One per watched virtual channel
pub struct FlowGraph {
    vchannel: Channel,
    kind: GraphKind,
    bus: Arc<dyn MsgBus>,
    tsafe: Arc<TSafeReplica>,
    consumer: parking_lot::Mutex<Option<Box<dyn BusConsumer>>>,
    pipeline: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl FlowGraph {
    fn new(
        vchannel: Channel,
        kind: GraphKind,
        bus: Arc<dyn MsgBus>,
        tsafe: Arc<TSafeReplica>,
    ) -> Self {
        Self {
            vchannel,
            kind,
            bus,
            tsafe,
            consumer: parking_lot::Mutex::new(None),
            pipeline: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn vchannel(&self) -> &str {
        &self.vchannel
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    /// Attach to a physical channel, consuming messages published from now on
    pub async fn consume(&self, pchannel: &str, sub: &str) -> Result<()> {
        let consumer = self
            .bus
            .subscribe(pchannel, sub, SubscribeFrom::Latest)
            .await?;
        *self.consumer.lock() = Some(consumer);
        debug!(vchannel = %self.vchannel, pchannel, sub, "flow graph attached as consumer");
        Ok(())
    }

    /// Attach to a physical channel from its latest position
    pub async fn consume_from_latest(&self, pchannel: &str, sub: &str) -> Result<()> {
        self.consume(pchannel, sub).await
    }

    /// Attach by seeking to a checkpoint position, then consuming.
    ///
    /// The position must already carry the physical channel name and the
    /// subscription group.
    pub async fn seek(&self, position: &Position) -> Result<()> {
        let consumer = self
            .bus
            .subscribe(
                &position.channel,
                &position.msg_group,
                SubscribeFrom::Position(position.clone()),
            )
            .await?;
        *self.consumer.lock() = Some(consumer);
        debug!(
            vchannel = %self.vchannel,
            pchannel = %position.channel,
            ts = position.timestamp,
            "flow graph seeked to checkpoint"
        );
        Ok(())
    }

    /// Start draining the consumer. Must be attached first.
    pub fn start(&self) {
        let Some(mut consumer) = self.consumer.lock().take() else {
            warn!(vchannel = %self.vchannel, "flow graph started without a consumer");
            return;
        };

        let vchannel = self.vchannel.clone();
        let tsafe = self.tsafe.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = consumer.recv() => {
                        match packet {
                            Some(packet) => {
                                // the entry disappears when release wins the
                                // race against a draining pipeline
                                if tsafe.set_tsafe(&vchannel, packet.timestamp).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!(vchannel = %vchannel, "flow graph pipeline stopped");
        });
        *self.pipeline.lock() = Some(handle);
    }

    /// Stop the pipeline and drop the consumer. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.pipeline.lock().take() {
            handle.abort();
        }
        self.consumer.lock().take();
    }
}

impl std::fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowGraph")
            .field("vchannel", &self.vchannel)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Registry of DML and delta flow graphs, keyed by virtual channel
pub struct FlowGraphService {
    bus: Arc<dyn MsgBus>,
    tsafe: Arc<TSafeReplica>,
    dml_graphs: DashMap<Channel, Arc<FlowGraph>>,
    delta_graphs: DashMap<Channel, Arc<FlowGraph>>,
}

impl FlowGraphService {
    pub fn new(bus: Arc<dyn MsgBus>, tsafe: Arc<TSafeReplica>) -> Self {
        Self {
            bus,
            tsafe,
            dml_graphs: DashMap::new(),
            delta_graphs: DashMap::new(),
        }
    }

    fn add_graphs(
        &self,
        collection_id: UniqueId,
        vchannels: &[Channel],
        kind: GraphKind,
    ) -> Result<HashMap<Channel, Arc<FlowGraph>>> {
        let graphs = match kind {
            GraphKind::Dml => &self.dml_graphs,
            GraphKind::Delta => &self.delta_graphs,
        };

        let mut created = HashMap::new();
        for vchannel in vchannels {
            let graph = Arc::new(FlowGraph::new(
                vchannel.clone(),
                kind,
                self.bus.clone(),
                self.tsafe.clone(),
            ));
            // the entry guard must drop before any other map access
            let inserted = match graphs.entry(vchannel.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(graph.clone());
                    true
                }
            };
            if !inserted {
                // undo this call's partial work before surfacing
                for channel in created.keys() {
                    if let Some((_, graph)) = graphs.remove(channel) {
                        graph.close();
                    }
                }
                return Err(Error::FlowGraphExists(vchannel.clone()));
            }
            created.insert(vchannel.clone(), graph);
        }
        info!(
            collection_id,
            ?kind,
            channels = ?vchannels,
            "flow graphs created"
        );
        Ok(created)
    }

    /// Create one DML graph per virtual channel; fails without residue if
    /// any channel already has one
    pub fn add_dml_flow_graphs(
        &self,
        collection_id: UniqueId,
        vchannels: &[Channel],
    ) -> Result<HashMap<Channel, Arc<FlowGraph>>> {
        self.add_graphs(collection_id, vchannels, GraphKind::Dml)
    }

    /// Create one delta graph per virtual channel
    pub fn add_delta_flow_graphs(
        &self,
        collection_id: UniqueId,
        vchannels: &[Channel],
    ) -> Result<HashMap<Channel, Arc<FlowGraph>>> {
        self.add_graphs(collection_id, vchannels, GraphKind::Delta)
    }

    pub fn has_dml_flow_graph(&self, vchannel: &str) -> bool {
        self.dml_graphs.contains_key(vchannel)
    }

    pub fn has_delta_flow_graph(&self, vchannel: &str) -> bool {
        self.delta_graphs.contains_key(vchannel)
    }

    /// Close and drop the DML graphs for the given channels
    pub fn remove_dml_flow_graphs(&self, vchannels: &[Channel]) {
        for vchannel in vchannels {
            if let Some((_, graph)) = self.dml_graphs.remove(vchannel) {
                graph.close();
                debug!(vchannel = %vchannel, "DML flow graph removed");
            }
        }
    }

    /// Close and drop the delta graphs for the given channels
    pub fn remove_delta_flow_graphs(&self, vchannels: &[Channel]) {
        for vchannel in vchannels {
            if let Some((_, graph)) = self.delta_graphs.remove(vchannel) {
                graph.close();
                debug!(vchannel = %vchannel, "delta flow graph removed");
            }
        }
    }
}

impl std::fmt::Debug for FlowGraphService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowGraphService")
            .field("dml_graphs", &self.dml_graphs.len())
            .field("delta_graphs", &self.delta_graphs.len())
            .finish()
    }
}
