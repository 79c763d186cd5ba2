//! Query shards: the per-DML-channel read handlers.
//!
//! Query execution itself is out of the control plane's hands; what lives
//! here is the registry of shards, the per-collection query channel the
//! coordinator talks to the node through, and the tSafe watches each shard
//! keeps on its DML and delta streams.

use crate::bus::{BusConsumer, MsgBus, SubscribeFrom};
use crate::channel::convert_channel;
use crate::config::Config;
use crate::error::Result;
use crate::tsafe::TSafeReplica;
use crate::Channel;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use vespid_protocol::{Position, Timestamp, UniqueId};

/// Per-collection channel the coordinator publishes query requests on
pub struct QueryChannel {
    collection_id: UniqueId,
    bus: Arc<dyn MsgBus>,
    consumer: parking_lot::Mutex<Option<Box<dyn BusConsumer>>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl QueryChannel {
    fn new(collection_id: UniqueId, bus: Arc<dyn MsgBus>) -> Self {
        Self {
            collection_id,
            bus,
            consumer: parking_lot::Mutex::new(None),
            handle: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn collection_id(&self) -> UniqueId {
        self.collection_id
    }

    /// Subscribe to the query channel, seeking when the position carries a
    /// message id
    pub async fn as_consumer(
        &self,
        channel: &str,
        sub: &str,
        position: Option<&Position>,
    ) -> Result<()> {
        let from = match position {
            Some(pos) if pos.is_seekable() => SubscribeFrom::Position(pos.clone()),
            _ => SubscribeFrom::Latest,
        };
        let consumer = self.bus.subscribe(channel, sub, from).await?;
        *self.consumer.lock() = Some(consumer);
        debug!(
            collection_id = self.collection_id,
            channel, sub, "query channel attached as consumer"
        );
        Ok(())
    }

    /// Start draining the channel; dispatch into the read path happens
    /// beyond the control plane
    pub fn start(&self) {
        let Some(mut consumer) = self.consumer.lock().take() else {
            return;
        };
        let collection_id = self.collection_id;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = consumer.recv() => match packet {
                        Some(packet) => {
                            trace!(collection_id, ts = packet.timestamp, "query request received");
                        }
                        None => break,
                    },
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.consumer.lock().take();
    }
}

/// Read handler for one DML channel, holding its tSafe watches
pub struct QueryShard {
    collection_id: UniqueId,
    channel: Channel,
    replica_id: i64,
    config: Arc<Config>,
    tsafe: Arc<TSafeReplica>,
    dml_ts: Arc<AtomicU64>,
    delta_ts: Arc<AtomicU64>,
    watchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl QueryShard {
    fn new(
        collection_id: UniqueId,
        channel: Channel,
        replica_id: i64,
        config: Arc<Config>,
        tsafe: Arc<TSafeReplica>,
    ) -> Self {
        Self {
            collection_id,
            channel,
            replica_id,
            config,
            tsafe,
            dml_ts: Arc::new(AtomicU64::new(0)),
            delta_ts: Arc::new(AtomicU64::new(0)),
            watchers: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn collection_id(&self) -> UniqueId {
        self.collection_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn replica_id(&self) -> i64 {
        self.replica_id
    }

    /// Latest DML watermark this shard has observed
    pub fn dml_tsafe(&self) -> Timestamp {
        self.dml_ts.load(Ordering::Acquire)
    }

    /// Latest delta watermark this shard has observed
    pub fn delta_tsafe(&self) -> Timestamp {
        self.delta_ts.load(Ordering::Acquire)
    }

    fn watch(&self, channel: &str, target: Arc<AtomicU64>) -> Result<()> {
        let mut rx = self.tsafe.watch_tsafe(channel)?;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        target.store(*rx.borrow(), Ordering::Release);
                    }
                }
            }
        });
        self.watchers.lock().push(handle);
        Ok(())
    }

    /// Follow the DML channel's tSafe watermark
    pub fn watch_dml_tsafe(&self) -> Result<()> {
        self.watch(&self.channel, self.dml_ts.clone())
    }

    /// Follow the paired delta channel's tSafe watermark
    pub fn watch_delta_tsafe(&self) -> Result<()> {
        let delta_channel = convert_channel(
            &self.channel,
            &self.config.dml_channel_root,
            &self.config.delta_channel_root,
        )?;
        self.watch(&delta_channel, self.delta_ts.clone())
    }

    fn close(&self) {
        self.cancel.cancel();
        for handle in self.watchers.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Registry of query shards and query channels
pub struct QueryShardService {
    config: Arc<Config>,
    tsafe: Arc<TSafeReplica>,
    bus: Arc<dyn MsgBus>,
    shards: DashMap<Channel, Arc<QueryShard>>,
    query_channels: DashMap<UniqueId, Arc<QueryChannel>>,
}

impl QueryShardService {
    pub fn new(config: Arc<Config>, tsafe: Arc<TSafeReplica>, bus: Arc<dyn MsgBus>) -> Self {
        Self {
            config,
            tsafe,
            bus,
            shards: DashMap::new(),
            query_channels: DashMap::new(),
        }
    }

    /// The query channel for a collection, created on first touch
    pub fn get_query_channel(&self, collection_id: UniqueId) -> Arc<QueryChannel> {
        self.query_channels
            .entry(collection_id)
            .or_insert_with(|| Arc::new(QueryChannel::new(collection_id, self.bus.clone())))
            .clone()
    }

    pub fn has_query_shard(&self, channel: &str) -> bool {
        self.shards.contains_key(channel)
    }

    /// Register a shard for a DML channel; existing registrations win
    pub fn add_query_shard(
        &self,
        collection_id: UniqueId,
        channel: &str,
        replica_id: i64,
    ) -> Arc<QueryShard> {
        self.shards
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(collection_id, channel, replica_id, "query shard added");
                Arc::new(QueryShard::new(
                    collection_id,
                    channel.to_string(),
                    replica_id,
                    self.config.clone(),
                    self.tsafe.clone(),
                ))
            })
            .clone()
    }

    pub fn get_query_shard(&self, channel: &str) -> Result<Arc<QueryShard>> {
        self.shards
            .get(channel)
            .map(|e| e.clone())
            .ok_or_else(|| crate::error::Error::QueryShardNotFound(channel.to_string()))
    }

    /// Shards currently registered for a collection
    pub fn collection_shard_count(&self, collection_id: UniqueId) -> usize {
        self.shards
            .iter()
            .filter(|e| e.collection_id() == collection_id)
            .count()
    }

    /// Drop the collection's shards and query channel
    pub fn release_collection(&self, collection_id: UniqueId) {
        self.shards.retain(|_, shard| {
            if shard.collection_id() == collection_id {
                shard.close();
                false
            } else {
                true
            }
        });
        if let Some((_, qc)) = self.query_channels.remove(&collection_id) {
            qc.stop();
        }
        info!(collection_id, "query shards released");
    }
}

impl std::fmt::Debug for QueryShardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryShardService")
            .field("shards", &self.shards.len())
            .field("query_channels", &self.query_channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;

    fn service() -> (Arc<TSafeReplica>, QueryShardService) {
        let tsafe = Arc::new(TSafeReplica::new());
        let svc = QueryShardService::new(Arc::new(Config::default()), tsafe.clone(), MemoryBus::new());
        (tsafe, svc)
    }

    #[tokio::test]
    async fn test_add_query_shard_idempotent() {
        let (_tsafe, svc) = service();
        let a = svc.add_query_shard(1, "vespid-dml_0_1v0", 2);
        let b = svc.add_query_shard(1, "vespid-dml_0_1v0", 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(svc.has_query_shard("vespid-dml_0_1v0"));
        assert_eq!(svc.collection_shard_count(1), 1);
    }

    #[tokio::test]
    async fn test_watch_dml_tsafe_requires_entry() {
        let (tsafe, svc) = service();
        let shard = svc.add_query_shard(1, "vespid-dml_0_1v0", 2);

        assert!(shard.watch_dml_tsafe().is_err());

        tsafe.add_tsafe("vespid-dml_0_1v0");
        shard.watch_dml_tsafe().unwrap();

        tsafe.set_tsafe("vespid-dml_0_1v0", 77).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while shard.dml_tsafe() < 77 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dml tsafe watch did not advance");
    }

    #[tokio::test]
    async fn test_watch_delta_tsafe_uses_paired_channel() {
        let (tsafe, svc) = service();
        let shard = svc.add_query_shard(1, "vespid-dml_0_1v0", 2);

        tsafe.add_tsafe("vespid-delta_0_1v0");
        shard.watch_delta_tsafe().unwrap();

        tsafe.set_tsafe("vespid-delta_0_1v0", 55).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while shard.delta_tsafe() < 55 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("delta tsafe watch did not advance");
    }

    #[tokio::test]
    async fn test_release_collection() {
        let (tsafe, svc) = service();
        tsafe.add_tsafe("a");
        svc.add_query_shard(1, "a", 2);
        svc.add_query_shard(9, "b", 2);
        svc.get_query_channel(1);

        svc.release_collection(1);
        assert!(!svc.has_query_shard("a"));
        assert!(svc.has_query_shard("b"));
        assert_eq!(svc.collection_shard_count(1), 0);
    }
}
