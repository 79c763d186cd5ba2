//! End-to-end tests for the control-plane task subsystem
//!
//! These tests drive a full query node through coordinator requests and
//! verify:
//! - WatchDmChannels happy path: replicas, excluded segments, flow graphs
//! - Rollback on bus failure leaves no partial flow graphs or growing segments
//! - ReleaseCollection returns the node to its pre-watch state
//! - WatchDeltaChannels ordering requirements and delete replay wiring
//! - LoadSegments idempotence
//! - ReleasePartitions best-effort semantics

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vespid_core::channel::physical;
use vespid_core::{
    BusConsumer, Config, MemoryBus, MsgBus, QueryNode, SubscribeFrom, TaskQueue,
};
use vespid_protocol::{
    ChannelWatchInfo, CollectionSchema, DataType, DeltaChannelInfo, FieldSchema, LoadKind,
    LoadMeta, LoadSegmentsRequest, MsgBase, MsgType, Position, ReleaseCollectionRequest,
    ReleasePartitionsRequest, SegmentInfo, SegmentLoadInfo, WatchDeltaChannelsRequest,
    WatchDmChannelsRequest,
};

const COLLECTION: i64 = 100;
const REPLICA: i64 = 2;
const V_CHANNEL: &str = "vespid-dml_0_100v0";
const V_DELTA_CHANNEL: &str = "vespid-delta_0_100v0";

fn test_node_with_bus(bus: Arc<dyn MsgBus>) -> Arc<QueryNode> {
    // zero graceful wait keeps release tests off the wall clock
    let config = Config::new().with_node_id(3).with_graceful_release_ms(0);
    QueryNode::new(config, bus)
}

fn test_node() -> (Arc<MemoryBus>, Arc<QueryNode>) {
    let bus = MemoryBus::new();
    (bus.clone(), test_node_with_bus(bus))
}

fn schema() -> Option<CollectionSchema> {
    Some(CollectionSchema {
        name: "vectors".to_string(),
        fields: vec![
            FieldSchema {
                field_id: 1,
                name: "id".to_string(),
                data_type: DataType::Int64,
                dim: 0,
            },
            FieldSchema {
                field_id: 2,
                name: "embedding".to_string(),
                data_type: DataType::FloatVector,
                dim: 128,
            },
        ],
    })
}

fn base(msg_type: MsgType, msg_id: i64, ts: u64) -> Option<MsgBase> {
    Some(MsgBase::new(msg_type, msg_id, ts))
}

fn seek_position(channel: &str, ts: u64) -> Position {
    Position {
        channel: channel.to_string(),
        msg_id: Bytes::from_static(b"x"),
        msg_group: String::new(),
        timestamp: ts,
    }
}

fn segment_info(id: i64, partition_id: i64, dml_position: Option<Position>) -> SegmentInfo {
    SegmentInfo {
        id,
        collection_id: COLLECTION,
        partition_id,
        binlogs: vec![format!("files/binlog/{}", id)],
        statslogs: vec![],
        deltalogs: vec![],
        num_rows: 1024,
        dml_position,
    }
}

/// The request of the happy-path scenario: one channel, seeked to ts=500,
/// one unflushed segment
fn watch_dm_request() -> WatchDmChannelsRequest {
    WatchDmChannelsRequest {
        base: base(MsgType::WatchDmChannels, 1, 500),
        collection_id: COLLECTION,
        partition_ids: vec![],
        schema: schema(),
        replica_id: REPLICA,
        infos: vec![ChannelWatchInfo {
            channel: V_CHANNEL.to_string(),
            seek_position: Some(seek_position(V_CHANNEL, 500)),
            unflushed_segments: vec![segment_info(7, 11, None)],
            flushed_segments: vec![],
            dropped_segments: vec![],
        }],
        load_meta: Some(LoadMeta {
            load_kind: LoadKind::Collection,
            partition_ids: vec![],
        }),
    }
}

fn load_segments_request(collection_id: i64, partition_ids: Vec<i64>) -> LoadSegmentsRequest {
    LoadSegmentsRequest {
        base: base(MsgType::LoadSegments, 9, 100),
        collection_id,
        schema: schema(),
        infos: vec![SegmentLoadInfo {
            segment_id: 70,
            partition_id: partition_ids[0],
            collection_id,
            binlog_paths: vec!["files/binlog/70".to_string()],
            statslog_paths: vec![],
            deltalog_paths: vec![],
            num_rows: 4096,
        }],
        load_meta: Some(LoadMeta {
            load_kind: LoadKind::Partition,
            partition_ids,
        }),
    }
}

/// Bus wrapper that fails subscriptions on chosen channels
struct FlakyBus {
    inner: Arc<MemoryBus>,
    fail_channels: parking_lot::Mutex<HashSet<String>>,
}

impl FlakyBus {
    fn new(inner: Arc<MemoryBus>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_channels: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    fn fail_on(&self, channel: &str) {
        self.fail_channels.lock().insert(channel.to_string());
    }
}

#[async_trait]
impl MsgBus for FlakyBus {
    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
        from: SubscribeFrom,
    ) -> vespid_core::Result<Box<dyn BusConsumer>> {
        if self.fail_channels.lock().contains(channel) {
            return Err(vespid_core::Error::Bus(format!(
                "injected subscribe failure on {}",
                channel
            )));
        }
        self.inner.subscribe(channel, group, from).await
    }
}

#[tokio::test]
async fn test_watch_dm_happy_path() {
    let (_bus, node) = test_node();

    node.watch_dm_channels(watch_dm_request()).await.unwrap();

    // collection and the growing segment's partition exist in both replicas
    assert!(node.streaming().has_collection(COLLECTION));
    assert!(node.historical().has_collection(COLLECTION));
    assert!(node.streaming().has_partition(11));
    assert!(node.historical().has_partition(11));

    // the growing segment landed in streaming only
    assert!(node.streaming().has_segment(7));
    assert!(!node.historical().has_segment(7));

    // unflushed segment is excluded so its bus messages are not re-applied
    let excluded = node.streaming().get_excluded_segments(COLLECTION);
    assert_eq!(excluded.len(), 1);
    assert_eq!(excluded[0].id, 7);

    // one flow graph, seeked and started; tSafe and shard registrations live
    assert!(node.flow_graphs().has_dml_flow_graph(V_CHANNEL));
    assert!(node.tsafe().has_tsafe(V_CHANNEL));
    assert!(node.shard_clusters().has_shard_cluster(V_CHANNEL));
    assert!(node.query_shards().has_query_shard(V_CHANNEL));

    let collection = node.streaming().get_collection(COLLECTION).unwrap();
    assert_eq!(collection.load_kind(), LoadKind::Collection);
}

#[tokio::test]
async fn test_watch_dm_channel_maps_stay_bijective() {
    let (_bus, node) = test_node();
    let mut req = watch_dm_request();
    req.infos.push(ChannelWatchInfo {
        channel: "vespid-dml_1_100v0".to_string(),
        seek_position: None,
        unflushed_segments: vec![],
        flushed_segments: vec![],
        dropped_segments: vec![],
    });

    node.watch_dm_channels(req).await.unwrap();

    for replica in [node.streaming(), node.historical()] {
        let collection = replica.get_collection(COLLECTION).unwrap();
        let v_channels = collection.v_channels();
        let p_channels = collection.p_channels();
        assert_eq!(v_channels.len(), 2);
        assert_eq!(v_channels.len(), p_channels.len());
        for (v, p) in v_channels.iter().zip(p_channels.iter()) {
            assert_eq!(&physical(v), p);
        }
    }
}

#[tokio::test]
async fn test_watch_dm_duplicate_channel_fails() {
    let (_bus, node) = test_node();
    let mut req = watch_dm_request();
    let duplicate = req.infos[0].clone();
    req.infos.push(duplicate);

    let err = node.watch_dm_channels(req).await;
    assert!(matches!(err, Err(vespid_core::Error::DuplicateChannel(_))));
}

#[tokio::test]
async fn test_watch_dm_rollback_on_bus_failure() {
    let memory = MemoryBus::new();
    let flaky = FlakyBus::new(memory);
    // the seek happens on the physical channel
    flaky.fail_on(&physical(V_CHANNEL));
    let node = test_node_with_bus(flaky);

    let err = node.watch_dm_channels(watch_dm_request()).await;
    assert!(matches!(err, Err(vespid_core::Error::Bus(_))));

    // no partial flow graphs, growing segment rolled back
    assert!(!node.flow_graphs().has_dml_flow_graph(V_CHANNEL));
    assert!(!node.streaming().has_segment(7));

    // collection creation is not rolled back
    assert!(node.streaming().has_collection(COLLECTION));
    assert!(node.historical().has_collection(COLLECTION));
}

#[tokio::test]
async fn test_watch_dm_then_release_round_trips() {
    let (_bus, node) = test_node();
    node.watch_dm_channels(watch_dm_request()).await.unwrap();

    // hold the collection handle to observe the release timestamp
    let collection = node.streaming().get_collection(COLLECTION).unwrap();

    node.release_collection(ReleaseCollectionRequest {
        base: base(MsgType::ReleaseCollection, 2, 999),
        collection_id: COLLECTION,
    })
    .await
    .unwrap();

    // release timestamp was stamped from the request before teardown
    assert_eq!(collection.release_ts(), 999);

    // the node is back to its pre-watch state
    assert!(!node.streaming().has_collection(COLLECTION));
    assert!(!node.historical().has_collection(COLLECTION));
    assert!(!node.flow_graphs().has_dml_flow_graph(V_CHANNEL));
    assert!(!node.tsafe().has_tsafe(V_CHANNEL));
    assert!(node.streaming().get_excluded_segments(COLLECTION).is_empty());
    assert_eq!(node.query_shards().collection_shard_count(COLLECTION), 0);
    assert_eq!(node.shard_clusters().count(), 0);
    assert!(!node.streaming().has_segment(7));
}

#[tokio::test]
async fn test_release_collection_missing_fails() {
    let (_bus, node) = test_node();
    let err = node
        .release_collection(ReleaseCollectionRequest {
            base: base(MsgType::ReleaseCollection, 3, 10),
            collection_id: 404,
        })
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_watch_delta_requires_prior_collection() {
    let (_bus, node) = test_node();

    let err = node
        .watch_delta_channels(WatchDeltaChannelsRequest {
            base: base(MsgType::WatchDeltaChannels, 4, 600),
            collection_id: 200,
            replica_id: REPLICA,
            infos: vec![DeltaChannelInfo {
                channel: "vespid-delta_0_200v0".to_string(),
                seek_position: None,
            }],
        })
        .await;

    assert!(matches!(
        err,
        Err(vespid_core::Error::CollectionNotFound(200))
    ));
}

#[tokio::test]
async fn test_watch_delta_happy_path() {
    let (_bus, node) = test_node();
    node.watch_dm_channels(watch_dm_request()).await.unwrap();

    node.watch_delta_channels(WatchDeltaChannelsRequest {
        base: base(MsgType::WatchDeltaChannels, 5, 700),
        collection_id: COLLECTION,
        replica_id: REPLICA,
        infos: vec![DeltaChannelInfo {
            channel: V_DELTA_CHANNEL.to_string(),
            seek_position: Some(seek_position(V_CHANNEL, 500)),
        }],
    })
    .await
    .unwrap();

    assert!(node.flow_graphs().has_delta_flow_graph(V_DELTA_CHANNEL));
    assert!(node.tsafe().has_tsafe(V_DELTA_CHANNEL));
    // the paired DML channel's query shard watches the delta watermark
    assert!(node.query_shards().has_query_shard(V_CHANNEL));

    for replica in [node.streaming(), node.historical()] {
        let collection = replica.get_collection(COLLECTION).unwrap();
        assert_eq!(collection.v_delta_channels(), vec![V_DELTA_CHANNEL]);
        assert_eq!(
            collection.p_delta_channels(),
            vec![physical(V_DELTA_CHANNEL)]
        );
    }
}

#[tokio::test]
async fn test_watch_delta_rollback_on_bus_failure() {
    let memory = MemoryBus::new();
    let flaky = FlakyBus::new(memory);
    let node = test_node_with_bus(flaky.clone());
    node.watch_dm_channels(watch_dm_request()).await.unwrap();

    flaky.fail_on(&physical(V_DELTA_CHANNEL));
    let err = node
        .watch_delta_channels(WatchDeltaChannelsRequest {
            base: base(MsgType::WatchDeltaChannels, 6, 700),
            collection_id: COLLECTION,
            replica_id: REPLICA,
            infos: vec![DeltaChannelInfo {
                channel: V_DELTA_CHANNEL.to_string(),
                seek_position: None,
            }],
        })
        .await;

    assert!(matches!(err, Err(vespid_core::Error::Bus(_))));
    assert!(!node.flow_graphs().has_delta_flow_graph(V_DELTA_CHANNEL));
    // the DM attachment survives
    assert!(node.flow_graphs().has_dml_flow_graph(V_CHANNEL));
}

#[tokio::test]
async fn test_load_segments_is_idempotent() {
    let (_bus, node) = test_node();

    node.load_segments(load_segments_request(300, vec![1, 2]))
        .await
        .unwrap();
    node.load_segments(load_segments_request(300, vec![1, 2]))
        .await
        .unwrap();

    let mut partitions = node.historical().partition_ids(300);
    partitions.sort_unstable();
    assert_eq!(partitions, vec![1, 2]);
    assert!(node.historical().has_segment(70));
    assert!(node.streaming().has_collection(300));
}

#[tokio::test]
async fn test_release_partitions_best_effort() {
    let (_bus, node) = test_node();
    node.load_segments(load_segments_request(300, vec![1, 2]))
        .await
        .unwrap();

    // unknown partition 999 is logged and skipped, the task still succeeds
    node.release_partitions(ReleasePartitionsRequest {
        base: base(MsgType::ReleasePartitions, 7, 800),
        collection_id: 300,
        partition_ids: vec![1, 999],
    })
    .await
    .unwrap();

    assert!(!node.historical().has_partition(1));
    assert!(node.historical().has_partition(2));
    // the partition's segments went with it
    assert!(!node.historical().has_segment(70));
}

#[tokio::test]
async fn test_release_partitions_requires_collection() {
    let (_bus, node) = test_node();
    let err = node
        .release_partitions(ReleasePartitionsRequest {
            base: base(MsgType::ReleasePartitions, 8, 800),
            collection_id: 404,
            partition_ids: vec![1],
        })
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_watch_dm_without_infos_still_creates_collection() {
    let (_bus, node) = test_node();
    let mut req = watch_dm_request();
    req.infos.clear();

    node.watch_dm_channels(req).await.unwrap();
    assert!(node.streaming().has_collection(COLLECTION));
    assert!(node.historical().has_collection(COLLECTION));
    assert!(node
        .streaming()
        .get_collection(COLLECTION)
        .unwrap()
        .v_channels()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_load_kind_resolution() {
    // empty partition ids: whole-collection load
    let (_bus, node) = test_node();
    let mut req = watch_dm_request();
    req.load_meta = Some(LoadMeta::default());
    node.watch_dm_channels(req).await.unwrap();
    assert_eq!(
        node.streaming()
            .get_collection(COLLECTION)
            .unwrap()
            .load_kind(),
        LoadKind::Collection
    );

    // explicit partition ids: partition load
    let (_bus, node) = test_node();
    let mut req = watch_dm_request();
    req.partition_ids = vec![5];
    req.load_meta = Some(LoadMeta {
        load_kind: LoadKind::Unknown,
        partition_ids: vec![5],
    });
    node.watch_dm_channels(req).await.unwrap();
    assert_eq!(
        node.streaming()
            .get_collection(COLLECTION)
            .unwrap()
            .load_kind(),
        LoadKind::Partition
    );
    assert!(node.streaming().has_partition(5));
    assert!(node.historical().has_partition(5));
}

#[tokio::test]
async fn test_excluded_segment_checkpoint_classification() {
    let (_bus, node) = test_node();
    let mut req = watch_dm_request();
    // flushed past the seek checkpoint: excluded
    req.infos[0]
        .flushed_segments
        .push(segment_info(20, 11, Some(seek_position(V_CHANNEL, 600))));
    // flushed before the checkpoint: kept
    req.infos[0]
        .flushed_segments
        .push(segment_info(21, 11, Some(seek_position(V_CHANNEL, 400))));
    // dropped without a checkpoint position: skipped, not dereferenced
    req.infos[0].dropped_segments.push(segment_info(22, 11, None));
    // dropped past the checkpoint: excluded
    req.infos[0]
        .dropped_segments
        .push(segment_info(23, 11, Some(seek_position(V_CHANNEL, 700))));

    node.watch_dm_channels(req).await.unwrap();

    let excluded: HashSet<i64> = node
        .streaming()
        .get_excluded_segments(COLLECTION)
        .iter()
        .map(|info| info.id)
        .collect();
    assert_eq!(excluded, HashSet::from([7, 20, 23]));
}

#[tokio::test]
async fn test_enqueue_without_base_assigns_random_id() {
    let (_bus, node) = test_node();
    let queue = TaskQueue::new(4);

    let mut req = load_segments_request(300, vec![1]);
    req.base = None;
    let task = vespid_core::task::LoadSegmentsTask::new(req, node);

    let handle = queue
        .enqueue(Box::new(task), CancellationToken::new())
        .await
        .unwrap();
    // a nonzero random id was assigned and the timestamp falls back to 0
    assert!(handle.id() > 0);
    assert_eq!(handle.timestamp(), 0);
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_interleaved_request_kinds_share_one_queue() {
    let (_bus, node) = test_node();

    node.load_segments(load_segments_request(300, vec![1]))
        .await
        .unwrap();
    node.watch_dm_channels(watch_dm_request()).await.unwrap();
    node.release_collection(ReleaseCollectionRequest {
        base: base(MsgType::ReleaseCollection, 11, 1000),
        collection_id: 300,
    })
    .await
    .unwrap();

    assert!(!node.historical().has_collection(300));
    assert!(node.streaming().has_collection(COLLECTION));
}
