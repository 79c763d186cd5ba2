//! The query node: wiring for both replicas, the services, the loader and
//! the control-plane task queue.

use crate::bus::MsgBus;
use crate::config::Config;
use crate::error::Result;
use crate::flowgraph::FlowGraphService;
use crate::loader::SegmentLoader;
use crate::query_shard::QueryShardService;
use crate::replica::ReplicaRegistry;
use crate::shard_cluster::ShardClusterService;
use crate::task::{
    AddQueryChannelTask, LoadSegmentsTask, ReleaseCollectionTask, ReleasePartitionsTask, Task,
    TaskQueue, WatchDeltaChannelsTask, WatchDmChannelsTask,
};
use crate::tsafe::TSafeReplica;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vespid_protocol::{
    AddQueryChannelRequest, LoadSegmentsRequest, ReleaseCollectionRequest,
    ReleasePartitionsRequest, WatchDeltaChannelsRequest, WatchDmChannelsRequest,
};

pub struct QueryNode {
    config: Arc<Config>,
    bus: Arc<dyn MsgBus>,
    streaming: Arc<ReplicaRegistry>,
    historical: Arc<ReplicaRegistry>,
    tsafe: Arc<TSafeReplica>,
    flow_graphs: Arc<FlowGraphService>,
    shard_clusters: Arc<ShardClusterService>,
    query_shards: Arc<QueryShardService>,
    loader: Arc<SegmentLoader>,
    queue: TaskQueue,
}

impl QueryNode {
    pub fn new(config: Config, bus: Arc<dyn MsgBus>) -> Arc<Self> {
        let config = Arc::new(config);
        let streaming = Arc::new(ReplicaRegistry::new("streaming"));
        let historical = Arc::new(ReplicaRegistry::new("historical"));
        let tsafe = Arc::new(TSafeReplica::new());
        let flow_graphs = Arc::new(FlowGraphService::new(bus.clone(), tsafe.clone()));
        let shard_clusters = Arc::new(ShardClusterService::new());
        let query_shards = Arc::new(QueryShardService::new(
            config.clone(),
            tsafe.clone(),
            bus.clone(),
        ));
        let loader = Arc::new(SegmentLoader::new(streaming.clone(), historical.clone()));
        let queue = TaskQueue::new(config.task_queue_capacity);

        info!(node_id = config.node_id, "query node initialized");
        Arc::new(Self {
            config,
            bus,
            streaming,
            historical,
            tsafe,
            flow_graphs,
            shard_clusters,
            query_shards,
            loader,
            queue,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn MsgBus> {
        &self.bus
    }

    pub fn streaming(&self) -> &Arc<ReplicaRegistry> {
        &self.streaming
    }

    pub fn historical(&self) -> &Arc<ReplicaRegistry> {
        &self.historical
    }

    pub fn tsafe(&self) -> &Arc<TSafeReplica> {
        &self.tsafe
    }

    pub fn flow_graphs(&self) -> &Arc<FlowGraphService> {
        &self.flow_graphs
    }

    pub fn shard_clusters(&self) -> &Arc<ShardClusterService> {
        &self.shard_clusters
    }

    pub fn query_shards(&self) -> &Arc<QueryShardService> {
        &self.query_shards
    }

    pub fn loader(&self) -> &Arc<SegmentLoader> {
        &self.loader
    }

    async fn run_task(&self, task: Box<dyn Task>) -> Result<()> {
        let handle = self.queue.enqueue(task, CancellationToken::new()).await?;
        handle.wait().await
    }

    pub async fn add_query_channel(self: &Arc<Self>, req: AddQueryChannelRequest) -> Result<()> {
        self.run_task(Box::new(AddQueryChannelTask::new(req, self.clone())))
            .await
    }

    pub async fn watch_dm_channels(self: &Arc<Self>, req: WatchDmChannelsRequest) -> Result<()> {
        self.run_task(Box::new(WatchDmChannelsTask::new(req, self.clone())))
            .await
    }

    pub async fn watch_delta_channels(
        self: &Arc<Self>,
        req: WatchDeltaChannelsRequest,
    ) -> Result<()> {
        self.run_task(Box::new(WatchDeltaChannelsTask::new(req, self.clone())))
            .await
    }

    pub async fn load_segments(self: &Arc<Self>, req: LoadSegmentsRequest) -> Result<()> {
        self.run_task(Box::new(LoadSegmentsTask::new(req, self.clone())))
            .await
    }

    pub async fn release_collection(
        self: &Arc<Self>,
        req: ReleaseCollectionRequest,
    ) -> Result<()> {
        self.run_task(Box::new(ReleaseCollectionTask::new(req, self.clone())))
            .await
    }

    pub async fn release_partitions(
        self: &Arc<Self>,
        req: ReleasePartitionsRequest,
    ) -> Result<()> {
        self.run_task(Box::new(ReleasePartitionsTask::new(req, self.clone())))
            .await
    }
}

impl std::fmt::Debug for QueryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryNode")
            .field("node_id", &self.config.node_id)
            .field("streaming_collections", &self.streaming.collection_count())
            .field(
                "historical_collections",
                &self.historical.collection_count(),
            )
            .finish()
    }
}

/// Best-effort return of freed heap pages to the OS after a release
pub(crate) fn reclaim_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}
